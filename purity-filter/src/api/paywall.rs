//! License paywall middleware
//!
//! Guards the filter routes. The `LicenseID` header must hold a UUID naming
//! a known, valid license. The resolved license is attached to the request
//! extensions for downstream handlers.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::warn;
use uuid::Uuid;

use crate::{ApiError, AppState};

/// Request header carrying the caller's license id
pub const LICENSE_HEADER: &str = "LicenseID";

pub async fn paywall_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let raw = request
        .headers()
        .get(LICENSE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .trim();

    let license_id = Uuid::parse_str(raw).map_err(|_| {
        warn!(header = %raw, "Rejected request with malformed license id");
        ApiError::Unauthorized("invalid license ID".to_string())
    })?;

    let license = state
        .ledger
        .get_by_id(&license_id.to_string())
        .await?
        .ok_or_else(|| {
            warn!(license_id = %license_id, "Rejected request with unknown license");
            ApiError::Unauthorized("invalid license".to_string())
        })?;

    if !license.is_valid {
        warn!(
            license_id = %license.id,
            reason = %license.validity_reason,
            "Rejected request with invalid license"
        );
        return Err(ApiError::Unauthorized("expired license".to_string()));
    }

    request.extensions_mut().insert(license);
    Ok(next.run(request).await)
}
