//! purity-filter library interface
//!
//! Exposes the service wiring for the binary and for integration tests.

pub mod api;
pub mod error;
pub mod services;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use purity_common::config::FilterConfig;
use crate::services::{BatchClassifier, LicenseLedger};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

/// Request handling limits taken from `[filter]`
#[derive(Debug, Clone, Copy)]
pub struct FilterSettings {
    /// Page size for forwarding a request batch to the classifier
    pub max_images_per_request: usize,
    /// Deadline for each provider call
    pub provider_timeout: Duration,
}

impl FilterSettings {
    pub fn from_config(config: &FilterConfig) -> Self {
        Self {
            max_images_per_request: config.max_images_per_request.max(1),
            provider_timeout: Duration::from_millis(config.provider_timeout_ms),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub classifier: Arc<BatchClassifier>,
    /// Ledger for the paywall and license lookup endpoint
    pub ledger: Arc<dyn LicenseLedger>,
    pub settings: FilterSettings,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        classifier: Arc<BatchClassifier>,
        ledger: Arc<dyn LicenseLedger>,
        settings: FilterSettings,
    ) -> Self {
        Self {
            classifier,
            ledger,
            settings,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
///
/// `/filter/*` sits behind the license paywall; health and license lookup
/// are public.
pub fn build_router(state: AppState) -> Router {
    use axum::middleware;

    let paywalled = api::filter_routes().layer(middleware::from_fn_with_state(
        state.clone(),
        api::paywall_middleware,
    ));

    Router::new()
        .merge(paywalled)
        .merge(api::license_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
