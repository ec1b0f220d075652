//! License lookup endpoint

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use purity_common::db::License;

use crate::{ApiError, ApiResult, AppState};

/// GET /license/:id
pub async fn get_license(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<License>> {
    let license = state
        .ledger
        .get_by_id(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("license {} not found", id)))?;

    Ok(Json(license))
}

pub fn license_routes() -> Router<AppState> {
    Router::new().route("/license/:id", get(get_license))
}
