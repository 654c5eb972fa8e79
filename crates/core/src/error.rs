//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid image id: {0}")]
    InvalidImageId(String),

    #[error("invalid instance id: {0}")]
    InvalidInstanceId(String),

    #[error("invalid port: {0}")]
    InvalidPort(i64),

    #[error("invalid principal class: {0}")]
    InvalidPrincipalClass(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
