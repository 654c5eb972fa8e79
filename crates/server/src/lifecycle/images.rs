//! Image lifecycle: create, finalise, destroy.

use super::error::{LifecycleError, LifecycleResult};
use super::locks::WriteGuard;
use super::{Lifecycle, detached};
use crate::metrics;
use clonedb_core::{Image, ImageId};
use clonedb_metadata::models::NewImage;
use time::OffsetDateTime;

impl Lifecycle {
    pub async fn list_images(&self) -> LifecycleResult<Vec<Image>> {
        let rows = self.metadata.list_images().await?;
        Ok(rows.into_iter().map(Image::from).collect())
    }

    pub async fn get_image(&self, image_id: ImageId) -> LifecycleResult<Image> {
        self.metadata
            .get_image(image_id.get())
            .await?
            .map(Image::from)
            .ok_or(LifecycleError::ImageNotFound(image_id))
    }

    /// Register a new backup and create its upload subvolume.
    ///
    /// The record is written first and the image is held exclusively until
    /// the subvolume exists. If the subvolume cannot be created the record
    /// stays behind, unready, and the error is returned.
    pub async fn create_image(
        &self,
        backed_up_at: OffsetDateTime,
        anonymisation_script: Vec<u8>,
    ) -> LifecycleResult<Image> {
        let this = self.clone();
        detached(async move {
            this.create_image_task(backed_up_at, anonymisation_script)
                .await
        })
        .await
    }

    async fn create_image_task(
        &self,
        backed_up_at: OffsetDateTime,
        anonymisation_script: Vec<u8>,
    ) -> LifecycleResult<Image> {
        let new = NewImage {
            backed_up_at,
            anonymisation_script,
            created_at: OffsetDateTime::now_utc(),
        };
        let row = self.metadata.create_image(&new).await.inspect_err(|e| {
            tracing::error!(operation = "create_image", error = %e, "Failed to record image");
        })?;
        let image = Image::from(row);

        // Held until the subvolume exists; the record is already visible to
        // finalise and destroy.
        let _lock = self.locks.image_write(image.id).await;
        if self.metadata.get_image(image.id.get()).await?.is_none() {
            tracing::warn!(image_id = %image.id, "Image destroyed before its subvolume was created");
            return Err(LifecycleError::ImageNotFound(image.id));
        }

        if let Err(e) = self.executor.create_subvolume(image.id).await {
            metrics::record_executor_failure("create_subvolume");
            tracing::error!(
                image_id = %image.id,
                operation = "create_subvolume",
                error = %e,
                "Failed to create upload subvolume, image record kept"
            );
            return Err(e.into());
        }

        metrics::IMAGES_CREATED.inc();
        tracing::info!(image_id = %image.id, backed_up_at = %image.backed_up_at, "Image created");
        Ok(image)
    }

    /// Anonymise an image and make it read-only.
    pub async fn finalise_image(&self, image_id: ImageId) -> LifecycleResult<Image> {
        let this = self.clone();
        detached(async move { this.finalise_image_task(image_id).await }).await
    }

    async fn finalise_image_task(&self, image_id: ImageId) -> LifecycleResult<Image> {
        let _lock = self.locks.image_write(image_id).await;

        let image = self.get_image(image_id).await?;
        if image.ready {
            return Err(LifecycleError::AlreadyReady(image_id));
        }

        if let Err(e) = self
            .executor
            .finalise_image(image_id, &image.anonymisation_script)
            .await
        {
            metrics::record_executor_failure("finalise_image");
            tracing::error!(
                image_id = %image_id,
                operation = "finalise_image",
                error = %e,
                "Failed to finalise image, left unready"
            );
            return Err(e.into());
        }

        let flipped = self
            .metadata
            .mark_image_ready(image_id.get(), OffsetDateTime::now_utc())
            .await
            .inspect_err(|e| {
                tracing::error!(
                    image_id = %image_id,
                    operation = "mark_image_ready",
                    error = %e,
                    "Image finalised on host but not marked ready"
                );
            })?;
        if !flipped {
            return Err(LifecycleError::AlreadyReady(image_id));
        }

        metrics::IMAGES_FINALISED.inc();
        tracing::info!(image_id = %image_id, "Image finalised");
        self.get_image(image_id).await
    }

    /// Destroy an image that has no instances.
    ///
    /// Never touches instances: an image with dependents is refused with
    /// [`LifecycleError::HasInstances`].
    pub async fn destroy_image(&self, image_id: ImageId) -> LifecycleResult<()> {
        let this = self.clone();
        detached(async move {
            let lock = this.locks.image_write(image_id).await;
            this.destroy_image_held(image_id, &lock).await
        })
        .await
    }

    /// Destroy an image while its write lock is held by the caller.
    pub(super) async fn destroy_image_held(
        &self,
        image_id: ImageId,
        _lock: &WriteGuard,
    ) -> LifecycleResult<()> {
        self.get_image(image_id).await?;

        let dependents = self
            .metadata
            .list_instances_for_image(image_id.get())
            .await?;
        if !dependents.is_empty() {
            return Err(LifecycleError::HasInstances {
                image_id,
                count: dependents.len(),
            });
        }

        if let Err(e) = self.executor.destroy_subvolume(image_id).await {
            metrics::record_executor_failure("destroy_subvolume");
            tracing::error!(
                image_id = %image_id,
                operation = "destroy_subvolume",
                error = %e,
                "Failed to delete image subvolumes, record kept"
            );
            return Err(e.into());
        }

        self.metadata
            .delete_image(image_id.get())
            .await
            .inspect_err(|e| {
                tracing::error!(
                    image_id = %image_id,
                    operation = "delete_image",
                    error = %e,
                    "Image subvolumes deleted but record remains"
                );
            })?;

        metrics::IMAGES_DESTROYED.inc();
        tracing::info!(image_id = %image_id, "Image destroyed");
        Ok(())
    }
}
