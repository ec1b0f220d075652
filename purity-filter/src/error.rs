//! Error types for purity-filter
//!
//! Every error body is `{"message": "..."}`. A trial running out mid-request
//! answers 402 and also carries the results produced before the quota ran out.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use purity_common::db::ImageAnnotation;
use serde_json::json;
use thiserror::Error;

use crate::services::ClassifyError;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request (400)
    #[error("{0}")]
    BadRequest(String),

    /// Missing, unknown or invalid license (401)
    #[error("{0}")]
    Unauthorized(String),

    /// Trial quota reached (402)
    #[error("{message}")]
    PaymentRequired {
        message: String,
        results: Vec<ImageAnnotation>,
    },

    /// Resource not found (404)
    #[error("{0}")]
    NotFound(String),

    /// Upstream classifier failure (502)
    #[error("{0}")]
    BadGateway(String),

    /// Internal server error (500)
    #[error("{0}")]
    Internal(String),

    /// purity-common error
    #[error("{0}")]
    Common(#[from] purity_common::Error),
}

impl From<ClassifyError> for ApiError {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::InvalidArgument(msg) => ApiError::BadRequest(msg),
            ClassifyError::LicenseNotFound(_) => ApiError::Unauthorized("invalid license".to_string()),
            ClassifyError::LicenseInvalid(_) => ApiError::Unauthorized("expired license".to_string()),
            ClassifyError::TrialExhausted { results } => ApiError::PaymentRequired {
                message: purity_common::db::TRIAL_EXPIRED_REASON.to_string(),
                results,
            },
            ClassifyError::Provider(e) => ApiError::BadGateway(e.to_string()),
            err @ (ClassifyError::LicenseLookupFailed(_) | ClassifyError::CacheLookupFailed(_)) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "message": msg })),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, json!({ "message": msg })),
            ApiError::PaymentRequired { message, results } => (
                StatusCode::PAYMENT_REQUIRED,
                json!({ "message": message, "results": results }),
            ),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "message": msg })),
            ApiError::BadGateway(msg) => {
                tracing::error!(error = %msg, "Classification provider failure");
                (StatusCode::BAD_GATEWAY, json!({ "message": msg }))
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "message": "Something went wrong" }))
            }
            ApiError::Common(err) => {
                tracing::error!(error = %err, "Storage error");
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "message": "Something went wrong" }))
            }
        };

        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
