//! Executor error types.

use clonedb_core::{ImageId, InstanceId};
use std::time::Duration;
use thiserror::Error;

/// Host operation errors.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("image {image_id} is still used by instances {instances:?}")]
    InUse {
        image_id: ImageId,
        instances: Vec<InstanceId>,
    },

    #[error("not a valid data directory: {0}")]
    InvalidDataDirectory(String),

    #[error("database process failed to start: {0}")]
    StartupFailed(String),

    #[error("command `{command}` failed with status {status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("no free port in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sidecar error: {0}")]
    Sidecar(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ExecError {
    /// Whether the error means the target simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for executor operations.
pub type ExecResult<T> = std::result::Result<T, ExecError>;
