//! Instance repository.

use crate::error::MetadataResult;
use crate::models::InstanceRow;
use async_trait::async_trait;

/// Repository for instance records.
#[async_trait]
pub trait InstanceRepo: Send + Sync {
    /// Reserve a fresh instance identifier. Reserved identifiers are never
    /// handed out again, whether or not a record is created with them.
    async fn reserve_instance_id(&self) -> MetadataResult<i64>;

    /// Insert an instance record. Fails with `Constraint` if the image is gone.
    async fn create_instance(&self, instance: &InstanceRow) -> MetadataResult<()>;

    /// Get an instance by ID.
    async fn get_instance(&self, instance_id: i64) -> MetadataResult<Option<InstanceRow>>;

    /// List all instances in ascending id order.
    async fn list_instances(&self) -> MetadataResult<Vec<InstanceRow>>;

    /// List instances cloned from an image, in ascending id order.
    async fn list_instances_for_image(&self, image_id: i64) -> MetadataResult<Vec<InstanceRow>>;

    /// Delete an instance. Returns whether a row was removed.
    async fn delete_instance(&self, instance_id: i64) -> MetadataResult<bool>;
}
