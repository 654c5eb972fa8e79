//! Lifecycle error types.

use clonedb_core::{ImageId, InstanceId};
use clonedb_exec::ExecError;
use clonedb_metadata::MetadataError;

/// Outcome of a failed lifecycle operation.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("image {0} not found")]
    ImageNotFound(ImageId),

    #[error("instance {0} not found")]
    InstanceNotFound(InstanceId),

    #[error("image {0} is already ready")]
    AlreadyReady(ImageId),

    #[error("image {image_id} still has {count} instance(s)")]
    HasInstances { image_id: ImageId, count: usize },

    #[error("image {0} is not ready")]
    ImageNotReady(ImageId),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("executor error: {0}")]
    Exec(#[from] ExecError),

    #[error("cascade destroy of image {image_id} stopped at instance {instance_id}: {source}")]
    CascadeFailed {
        image_id: ImageId,
        instance_id: InstanceId,
        source: Box<LifecycleError>,
    },

    #[error("operation task aborted: {0}")]
    Aborted(String),
}

impl LifecycleError {
    /// Whether the failure came from the store or the host rather than
    /// from a precondition.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Metadata(_) | Self::Exec(_) | Self::CascadeFailed { .. } | Self::Aborted(_)
        )
    }
}

/// Result type for lifecycle operations.
pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;
