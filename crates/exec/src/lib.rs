//! Host-side execution for clonedb.
//!
//! This crate owns everything that touches the host rather than the store:
//! - Copy-on-write subvolumes for uploads, finalised images and instances
//! - Port allocation for instance database processes
//! - Starting, probing and stopping those processes
//!
//! The orchestrator talks to it only through the [`Executor`] trait.

pub mod driver;
pub mod error;
pub mod executor;
pub mod host;
pub mod layout;
pub mod ports;
pub mod process;

pub use driver::SubvolumeDriver;
pub use error::{ExecError, ExecResult};
pub use executor::Executor;
pub use host::HostExecutor;
pub use ports::PortAllocator;

use clonedb_core::config::ExecutorConfig;
use std::sync::Arc;

/// Create an executor from configuration.
pub async fn from_config(config: &ExecutorConfig) -> ExecResult<Arc<dyn Executor>> {
    let executor = HostExecutor::new(config.clone()).await?;
    Ok(Arc::new(executor))
}
