//! API error types.

use crate::lifecycle::LifecycleError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Detail sent in place of internal error messages.
const INTERNAL_DETAIL: &str = "Something went wrong, the error has been logged";

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Short summary of the error class.
    pub title: String,
    /// Human-readable explanation.
    pub detail: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unprocessable: {0}")]
    Unprocessable(String),

    #[error("missing API version header")]
    MissingApiVersion,

    #[error("invalid API version: {0}")]
    InvalidApiVersion(String),

    /// Carries the full cause for logs; the response body never does.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Conflict(_) => "conflict",
            Self::Unprocessable(_) => "unprocessable_entity",
            Self::MissingApiVersion => "missing_api_version",
            Self::InvalidApiVersion(_) => "invalid_api_version",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::MissingApiVersion => StatusCode::BAD_REQUEST,
            Self::InvalidApiVersion(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "Resource Not Found",
            Self::BadRequest(_) => "Bad Request",
            Self::Unauthorized(_) => "Unauthorized",
            Self::Conflict(_) => "Conflict",
            Self::Unprocessable(_) => "Unprocessable Entity",
            Self::MissingApiVersion => "Missing API Version Header",
            Self::InvalidApiVersion(_) => "Invalid API Version",
            Self::Internal(_) => "Internal Server Error",
        }
    }

    fn detail(&self) -> String {
        match self {
            Self::NotFound(msg)
            | Self::BadRequest(msg)
            | Self::Unauthorized(msg)
            | Self::Conflict(msg)
            | Self::Unprocessable(msg) => msg.clone(),
            Self::MissingApiVersion => format!(
                "No API version specified in {} header",
                crate::version::API_VERSION_HEADER
            ),
            Self::InvalidApiVersion(requested) => format!(
                "Specified API version ({requested}) does not match server version ({})",
                crate::version::API_VERSION
            ),
            Self::Internal(_) => INTERNAL_DETAIL.to_string(),
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::ImageNotFound(id) => Self::NotFound(format!("image {id} not found")),
            LifecycleError::InstanceNotFound(id) => {
                Self::NotFound(format!("instance {id} not found"))
            }
            LifecycleError::AlreadyReady(id) => {
                Self::Conflict(format!("image {id} is already finalised"))
            }
            LifecycleError::HasInstances { image_id, count } => Self::Conflict(format!(
                "image {image_id} has {count} instance(s); destroy them first"
            )),
            LifecycleError::ImageNotReady(id) => {
                Self::Unprocessable(format!("image {id} is not ready to be cloned"))
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<clonedb_metadata::MetadataError> for ApiError {
    fn from(err: clonedb_metadata::MetadataError) -> Self {
        Self::Internal(format!("metadata error: {err}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(cause) = &self {
            tracing::error!(error = %cause, "Request failed with internal error");
        }
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code().to_string(),
            title: self.title().to_string(),
            detail: self.detail(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
