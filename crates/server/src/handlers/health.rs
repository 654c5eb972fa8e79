//! Health check endpoint.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use serde::Serialize;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub executor: &'static str,
}

/// GET /health_check - Health check.
///
/// Unauthenticated so load balancers and orchestrators can probe it.
/// Returns only non-sensitive information.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    state.metadata.health_check().await?;
    state
        .executor
        .health_check()
        .await
        .map_err(|e| ApiError::Internal(format!("executor health check failed: {e}")))?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        executor: state.executor.backend_name(),
    }))
}
