//! Image repository.

use crate::error::MetadataResult;
use crate::models::{ImageRow, NewImage};
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for image records.
#[async_trait]
pub trait ImageRepo: Send + Sync {
    /// Insert an image with `ready = false`, returning the stored row with its
    /// newly assigned identifier.
    async fn create_image(&self, image: &NewImage) -> MetadataResult<ImageRow>;

    /// Get an image by ID.
    async fn get_image(&self, image_id: i64) -> MetadataResult<Option<ImageRow>>;

    /// List all images, oldest first.
    async fn list_images(&self) -> MetadataResult<Vec<ImageRow>>;

    /// Flip `ready` to true. Returns false if the image does not exist or
    /// was already ready; the flag never flips back.
    async fn mark_image_ready(&self, image_id: i64, at: OffsetDateTime) -> MetadataResult<bool>;

    /// Delete an image. Returns whether a row was removed.
    ///
    /// Fails with `Constraint` while instance records still reference it.
    async fn delete_image(&self, image_id: i64) -> MetadataResult<bool>;
}
