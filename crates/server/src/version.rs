//! API version negotiation.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

/// Header clients use to state the API version they speak.
pub const API_VERSION_HEADER: &str = "Clonedb-Version";

/// Version the server speaks.
pub const API_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Reject requests whose version header is missing or differs from ours.
pub async fn api_version_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.config.server.require_api_version {
        let requested = req
            .headers()
            .get(API_VERSION_HEADER)
            .ok_or(ApiError::MissingApiVersion)?;
        let requested = requested.to_str().unwrap_or_default().trim();
        if requested != API_VERSION {
            return Err(ApiError::InvalidApiVersion(requested.to_string()));
        }
    }
    Ok(next.run(req).await)
}
