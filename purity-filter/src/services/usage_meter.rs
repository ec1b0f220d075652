//! Usage meter reporting
//!
//! Billed image counts are pushed to Stripe as metered usage records on the
//! first item of the license's subscription.

use async_trait::async_trait;
use purity_common::db::License;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str = concat!("purity-filter/", env!("CARGO_PKG_VERSION"));

/// Meter errors
#[derive(Debug, Error)]
pub enum MeterError {
    #[error("License {0} has no subscription")]
    NoSubscription(String),

    #[error("Subscription {0} has no items")]
    NoSubscriptionItem(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("API error {0}: {1}")]
    ApiError(u16, String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

/// External billing sink for consumed units
#[async_trait]
pub trait UsageMeter: Send + Sync {
    async fn report(&self, license: &License, quantity: u64) -> Result<(), MeterError>;
}

/// Meter used when billing is not configured
#[derive(Debug, Default)]
pub struct NoopUsageMeter;

#[async_trait]
impl UsageMeter for NoopUsageMeter {
    async fn report(&self, license: &License, quantity: u64) -> Result<(), MeterError> {
        tracing::debug!(license_id = %license.id, quantity, "Usage metering disabled, skipping report");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct Subscription {
    items: SubscriptionItems,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItems {
    #[serde(default)]
    data: Vec<SubscriptionItem>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItem {
    id: String,
}

/// Stripe metered billing client
pub struct StripeUsageMeter {
    http_client: reqwest::Client,
    api_base: String,
    secret_key: String,
}

impl StripeUsageMeter {
    pub fn new(api_base: String, secret_key: String) -> Result<Self, MeterError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| MeterError::NetworkError(e.to_string()))?;

        Ok(Self {
            http_client,
            api_base: api_base.trim_end_matches('/').to_string(),
            secret_key,
        })
    }

    async fn first_subscription_item(&self, subscription_id: &str) -> Result<String, MeterError> {
        let url = format!("{}/subscriptions/{}", self.api_base, subscription_id);
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| MeterError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(MeterError::ApiError(status.as_u16(), error_text));
        }

        let subscription: Subscription = response
            .json()
            .await
            .map_err(|e| MeterError::ParseError(e.to_string()))?;

        subscription
            .items
            .data
            .into_iter()
            .next()
            .map(|item| item.id)
            .ok_or_else(|| MeterError::NoSubscriptionItem(subscription_id.to_string()))
    }
}

#[async_trait]
impl UsageMeter for StripeUsageMeter {
    async fn report(&self, license: &License, quantity: u64) -> Result<(), MeterError> {
        if license.subscription_id.is_empty() {
            return Err(MeterError::NoSubscription(license.id.clone()));
        }

        let item_id = self.first_subscription_item(&license.subscription_id).await?;
        let url = format!("{}/subscription_items/{}/usage_records", self.api_base, item_id);
        let params = [
            ("quantity", quantity.to_string()),
            ("action", "increment".to_string()),
            ("timestamp", chrono::Utc::now().timestamp().to_string()),
        ];

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.secret_key)
            .form(&params)
            .send()
            .await
            .map_err(|e| MeterError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(MeterError::ApiError(status.as_u16(), error_text));
        }

        tracing::info!(
            license_id = %license.id,
            subscription_item = %item_id,
            quantity,
            "Reported metered usage"
        );
        Ok(())
    }
}
