//! Principal-aware image destruction.

use super::error::{LifecycleError, LifecycleResult};
use super::{Lifecycle, detached};
use crate::metrics;
use clonedb_core::{ImageId, InstanceId, Principal, PrincipalClass};

impl Lifecycle {
    /// Destroy an image on behalf of `principal`.
    ///
    /// Ordinary principals get a plain destroy, refused while instances
    /// exist. The upload principal destroys every dependent instance first.
    pub async fn destroy_image_as(
        &self,
        principal: &Principal,
        image_id: ImageId,
    ) -> LifecycleResult<()> {
        match principal.class {
            PrincipalClass::Ordinary => self.destroy_image(image_id).await,
            PrincipalClass::Upload => {
                tracing::info!(
                    image_id = %image_id,
                    principal = %principal.identity,
                    "Cascading image destroy"
                );
                self.cascade_destroy_image(image_id).await
            }
        }
    }

    /// Destroy every instance of an image in ascending id order, then the
    /// image.
    ///
    /// An instance that is already gone counts as destroyed. Any other
    /// failure stops the cascade before the image is touched; a retry picks
    /// up with the survivors.
    pub async fn cascade_destroy_image(&self, image_id: ImageId) -> LifecycleResult<()> {
        let this = self.clone();
        detached(async move { this.cascade_task(image_id).await }).await
    }

    async fn cascade_task(&self, image_id: ImageId) -> LifecycleResult<()> {
        let lock = self.locks.image_write(image_id).await;

        self.get_image(image_id).await?;

        let mut dependents: Vec<InstanceId> = self
            .metadata
            .list_instances_for_image(image_id.get())
            .await?
            .into_iter()
            .map(|row| InstanceId::new(row.instance_id))
            .collect();
        dependents.sort_unstable();

        for instance_id in &dependents {
            match self.remove_instance(*instance_id).await {
                Ok(()) | Err(LifecycleError::InstanceNotFound(_)) => {}
                Err(e) => {
                    tracing::error!(
                        image_id = %image_id,
                        instance_id = %instance_id,
                        error = %e,
                        "Cascade destroy aborted, image kept"
                    );
                    return Err(LifecycleError::CascadeFailed {
                        image_id,
                        instance_id: *instance_id,
                        source: Box::new(e),
                    });
                }
            }
        }

        self.destroy_image_held(image_id, &lock).await?;
        metrics::CASCADE_DESTROYS.inc();
        tracing::info!(
            image_id = %image_id,
            instances = dependents.len(),
            "Cascade destroy complete"
        );
        Ok(())
    }
}
