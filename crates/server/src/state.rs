//! Application state shared across handlers.

use crate::auth::{Authenticator, TokenAuthenticator};
use crate::lifecycle::Lifecycle;
use clonedb_core::config::AppConfig;
use clonedb_exec::Executor;
use clonedb_metadata::MetadataStore;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    /// Host executor.
    pub executor: Arc<dyn Executor>,
    /// Image and instance orchestration over the two above.
    pub lifecycle: Lifecycle,
    /// Bearer token resolution.
    pub authenticator: Arc<dyn Authenticator>,
}

impl AppState {
    /// Create the state with the token-table authenticator.
    pub fn new(
        config: AppConfig,
        metadata: Arc<dyn MetadataStore>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let lifecycle = Lifecycle::new(metadata.clone(), executor.clone());
        let authenticator = Arc::new(TokenAuthenticator::new(metadata.clone()));

        Self {
            config: Arc::new(config),
            metadata,
            executor,
            lifecycle,
            authenticator,
        }
    }

    /// Replace the authenticator.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }
}
