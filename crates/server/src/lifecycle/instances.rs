//! Instance lifecycle: create and destroy.

use super::error::{LifecycleError, LifecycleResult};
use super::{Lifecycle, detached};
use crate::metrics;
use clonedb_core::{ImageId, Instance, InstanceId};
use clonedb_metadata::MetadataError;
use clonedb_metadata::models::InstanceRow;
use time::OffsetDateTime;

impl Lifecycle {
    pub async fn list_instances(&self) -> LifecycleResult<Vec<Instance>> {
        let rows = self.metadata.list_instances().await?;
        rows.into_iter()
            .map(|row| Instance::try_from(row).map_err(|e| LifecycleError::Metadata(e.into())))
            .collect()
    }

    pub async fn get_instance(&self, instance_id: InstanceId) -> LifecycleResult<Instance> {
        let row = self
            .metadata
            .get_instance(instance_id.get())
            .await?
            .ok_or(LifecycleError::InstanceNotFound(instance_id))?;
        Ok(Instance::try_from(row).map_err(MetadataError::from)?)
    }

    /// Clone a ready image into a running instance.
    pub async fn create_instance(&self, image_id: ImageId) -> LifecycleResult<Instance> {
        let this = self.clone();
        detached(async move { this.create_instance_task(image_id).await }).await
    }

    async fn create_instance_task(&self, image_id: ImageId) -> LifecycleResult<Instance> {
        let _image_lock = self.locks.image_read(image_id).await;

        let image = self.get_image(image_id).await?;
        if !image.can_clone() {
            return Err(LifecycleError::ImageNotReady(image_id));
        }

        let instance_id = InstanceId::new(self.metadata.reserve_instance_id().await.inspect_err(
            |e| {
                tracing::error!(
                    image_id = %image_id,
                    operation = "reserve_instance_id",
                    error = %e,
                    "Failed to reserve instance id"
                );
            },
        )?);
        let _instance_lock = self.locks.instance_write(instance_id).await;

        let timer = metrics::INSTANCE_CREATE_DURATION.start_timer();
        let port = match self.executor.create_instance(image_id, instance_id).await {
            Ok(port) => port,
            Err(e) => {
                timer.stop_and_discard();
                metrics::record_executor_failure("create_instance");
                tracing::error!(
                    image_id = %image_id,
                    instance_id = %instance_id,
                    operation = "create_instance",
                    error = %e,
                    "Failed to start instance"
                );
                return Err(e.into());
            }
        };
        timer.observe_duration();

        let now = OffsetDateTime::now_utc();
        let instance = Instance {
            id: instance_id,
            image_id,
            port,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self
            .metadata
            .create_instance(&InstanceRow::new(&instance))
            .await
        {
            tracing::error!(
                image_id = %image_id,
                instance_id = %instance_id,
                port = port,
                operation = "create_instance_record",
                error = %e,
                "Failed to record running instance, destroying it"
            );
            if let Err(cleanup) = self.executor.destroy_instance(instance_id).await {
                metrics::record_executor_failure("destroy_instance");
                tracing::error!(
                    instance_id = %instance_id,
                    port = port,
                    error = %cleanup,
                    "Failed to destroy unrecorded instance"
                );
            }
            return Err(e.into());
        }

        metrics::INSTANCES_CREATED.inc();
        metrics::LIVE_INSTANCES.inc();
        tracing::info!(
            image_id = %image_id,
            instance_id = %instance_id,
            port = port,
            "Instance created"
        );
        Ok(instance)
    }

    /// Stop an instance and delete its snapshot and record.
    pub async fn destroy_instance(&self, instance_id: InstanceId) -> LifecycleResult<()> {
        let this = self.clone();
        detached(async move { this.remove_instance(instance_id).await }).await
    }

    /// Destroy one instance under its own lock. Shared with the cascade,
    /// which already runs detached.
    pub(super) async fn remove_instance(&self, instance_id: InstanceId) -> LifecycleResult<()> {
        let _lock = self.locks.instance_write(instance_id).await;

        let instance = self.get_instance(instance_id).await?;

        match self.executor.destroy_instance(instance_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::warn!(
                    instance_id = %instance_id,
                    "Instance already absent on host, removing record"
                );
            }
            Err(e) => {
                metrics::record_executor_failure("destroy_instance");
                tracing::error!(
                    instance_id = %instance_id,
                    image_id = %instance.image_id,
                    operation = "destroy_instance",
                    error = %e,
                    "Failed to destroy instance, record kept"
                );
                return Err(e.into());
            }
        }

        self.metadata
            .delete_instance(instance_id.get())
            .await
            .inspect_err(|e| {
                tracing::error!(
                    instance_id = %instance_id,
                    operation = "delete_instance",
                    error = %e,
                    "Instance destroyed on host but record remains"
                );
            })?;

        metrics::INSTANCES_DESTROYED.inc();
        metrics::LIVE_INSTANCES.dec();
        tracing::info!(
            instance_id = %instance_id,
            image_id = %instance.image_id,
            port = instance.port,
            "Instance destroyed"
        );
        Ok(())
    }
}
