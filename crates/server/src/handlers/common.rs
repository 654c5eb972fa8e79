//! Shared handler helpers.

use crate::error::{ApiError, ApiResult};
use axum::extract::Request;
use clonedb_core::{ImageId, InstanceId};
use serde::de::DeserializeOwned;

/// Maximum request body size (1 MiB). Anonymisation scripts are the
/// largest thing a client sends.
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Read and parse a JSON request body.
pub async fn read_json<T: DeserializeOwned>(req: Request) -> ApiResult<T> {
    let bytes = axum::body::to_bytes(req.into_body(), MAX_BODY_SIZE)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))
}

/// Parse an image id path segment. A segment that is not an id cannot name
/// an image, so it is reported as not found.
pub fn parse_image_id(raw: &str) -> ApiResult<ImageId> {
    ImageId::parse(raw).map_err(|_| ApiError::NotFound(format!("image {raw} not found")))
}

/// Parse an instance id path segment.
pub fn parse_instance_id(raw: &str) -> ApiResult<InstanceId> {
    InstanceId::parse(raw).map_err(|_| ApiError::NotFound(format!("instance {raw} not found")))
}
