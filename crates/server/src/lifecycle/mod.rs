//! Image and instance lifecycle orchestration.
//!
//! [`Lifecycle`] drives images and instances through their states using the
//! metadata store for records and the executor for host state, and keeps the
//! two in agreement:
//!
//! - Image creation records first, then materialises the upload subvolume.
//! - Finalise runs the executor first and flips `ready` only on success.
//! - Destroys act on the host first and delete the record last, so a failure
//!   leaves a record describing something that may still exist.
//!
//! Every mutating operation runs on its own task. A caller that goes away
//! (for example a disconnected HTTP client) does not interrupt an executor
//! call half way through.

mod cascade;
mod error;
mod images;
mod instances;
pub mod locks;

pub use error::{LifecycleError, LifecycleResult};
pub use locks::EntityLocks;

use clonedb_exec::Executor;
use clonedb_metadata::MetadataStore;
use std::future::Future;
use std::sync::Arc;

/// Lifecycle orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct Lifecycle {
    metadata: Arc<dyn MetadataStore>,
    executor: Arc<dyn Executor>,
    locks: Arc<EntityLocks>,
}

impl Lifecycle {
    pub fn new(metadata: Arc<dyn MetadataStore>, executor: Arc<dyn Executor>) -> Self {
        Self {
            metadata,
            executor,
            locks: Arc::new(EntityLocks::new()),
        }
    }

    pub fn locks(&self) -> &EntityLocks {
        &self.locks
    }
}

/// Run an operation on a detached task and wait for its result.
async fn detached<F, T>(operation: F) -> LifecycleResult<T>
where
    F: Future<Output = LifecycleResult<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(operation).await.map_err(|e| {
        tracing::error!(error = %e, "Lifecycle task failed to complete");
        LifecycleError::Aborted(e.to_string())
    })?
}
