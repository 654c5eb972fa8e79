//! The executor contract.

use crate::error::ExecResult;
use async_trait::async_trait;
use clonedb_core::{ImageId, InstanceId};

/// Non-idempotent host operations behind image and instance lifecycles.
///
/// Callers never issue two calls for the same identifier concurrently.
/// Every call runs to completion once started.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Create the writable upload subvolume for a newly registered image.
    async fn create_subvolume(&self, image_id: ImageId) -> ExecResult<()>;

    /// Run the anonymisation script against the upload and seal it as a
    /// read-only image. A second call on a finalised image does nothing.
    async fn finalise_image(&self, image_id: ImageId, anonymisation_script: &[u8])
    -> ExecResult<()>;

    /// Delete every subvolume belonging to an image.
    ///
    /// Fails with `InUse` while instances still derive from it. Deleting an
    /// image that has no subvolumes left succeeds.
    async fn destroy_subvolume(&self, image_id: ImageId) -> ExecResult<()>;

    /// Snapshot a finalised image, allocate a port and start a database
    /// process on it, returning once it accepts connections.
    ///
    /// On failure nothing is left behind: no process, snapshot or port.
    async fn create_instance(&self, image_id: ImageId, instance_id: InstanceId) -> ExecResult<u16>;

    /// Stop an instance's process (forcefully after a grace period) and
    /// delete its snapshot. `NotFound` when nothing exists for the id.
    async fn destroy_instance(&self, instance_id: InstanceId) -> ExecResult<()>;

    /// Check that the host side is usable.
    async fn health_check(&self) -> ExecResult<()>;

    /// Short name for logs.
    fn backend_name(&self) -> &'static str;
}
