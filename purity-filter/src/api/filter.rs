//! Batch filter endpoint
//!
//! POST /filter/batch with `{"imgURIList": [...]}`. References are validated
//! and deduplicated here, then forwarded to the classifier in pages of
//! `max_images_per_request`.

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::post,
    Extension, Json, Router,
};
use purity_common::db::{ImageAnnotation, License};
use reqwest::Url;
use serde::Deserialize;

use crate::services::classifier::dedup_references;
use crate::services::ClassifyError;
use crate::{ApiError, ApiResult, AppState};

/// Batch filter request body
#[derive(Debug, Deserialize)]
pub struct BatchFilterRequest {
    #[serde(rename = "imgURIList")]
    pub img_uri_list: Vec<String>,
}

/// Absolute URI with a scheme and a hierarchical part
pub fn is_valid_reference(reference: &str) -> bool {
    Url::parse(reference)
        .map(|url| !url.cannot_be_a_base())
        .unwrap_or(false)
}

/// POST /filter/batch
pub async fn filter_batch(
    State(state): State<AppState>,
    Extension(license): Extension<License>,
    payload: Result<Json<BatchFilterRequest>, JsonRejection>,
) -> ApiResult<Json<Vec<ImageAnnotation>>> {
    let Json(request) = payload
        .map_err(|_| ApiError::BadRequest("JSON body missing or malformed".to_string()))?;

    if request.img_uri_list.is_empty() {
        return Err(ApiError::BadRequest("ImgUriList cannot be empty".to_string()));
    }

    if let Some(invalid) = request.img_uri_list.iter().find(|uri| !is_valid_reference(uri)) {
        return Err(ApiError::BadRequest(format!("{} is not a valid URI", invalid)));
    }

    let references = dedup_references(&request.img_uri_list);
    tracing::info!(
        license_id = %license.id,
        submitted = request.img_uri_list.len(),
        unique = references.len(),
        "Batch filter request"
    );

    let mut results = Vec::with_capacity(references.len());
    for page in references.chunks(state.settings.max_images_per_request) {
        match state
            .classifier
            .classify(page, &license.id, state.settings.provider_timeout)
            .await
        {
            Ok(page_results) => results.extend(page_results),
            Err(ClassifyError::TrialExhausted { results: page_results }) => {
                results.extend(page_results);
                return Err(ClassifyError::TrialExhausted { results }.into());
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Json(results))
}

pub fn filter_routes() -> Router<AppState> {
    Router::new().route("/filter/batch", post(filter_batch))
}
