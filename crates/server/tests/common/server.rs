//! Server test utilities.

use super::executor::RecordingExecutor;
use super::metadata::TestMetadata;
use clonedb_core::config::{AppConfig, MetadataConfig};
use clonedb_metadata::{MetadataStore, SqliteStore};
use clonedb_server::bootstrap::ensure_tokens;
use clonedb_server::{AppState, Lifecycle, create_router};
use std::sync::Arc;
use tempfile::TempDir;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub executor: Arc<RecordingExecutor>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a test server with the test configuration.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let db_path = temp_dir.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path, None)
                .await
                .expect("Failed to create metadata store"),
        );

        let mut config = AppConfig::for_testing();
        config.metadata = MetadataConfig::Sqlite {
            path: db_path,
            query_timeout_secs: None,
        };
        config.executor.root = temp_dir.path().join("data");
        modifier(&mut config);

        ensure_tokens(metadata.as_ref(), &config.auth)
            .await
            .expect("Failed to bootstrap tokens");

        let executor = Arc::new(RecordingExecutor::new());
        let state = AppState::new(config, metadata, executor.clone());
        let router = create_router(state.clone());

        Self {
            router,
            state,
            executor,
            _temp_dir: temp_dir,
        }
    }

    /// Get access to the underlying metadata.
    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.state.metadata.clone()
    }
}

/// A lifecycle over a fresh SQLite store and a recording executor.
#[allow(dead_code)]
pub struct TestLifecycle {
    pub lifecycle: Lifecycle,
    pub executor: Arc<RecordingExecutor>,
    pub metadata: TestMetadata,
}

#[allow(dead_code)]
impl TestLifecycle {
    pub async fn new() -> Self {
        Self::with_executor(RecordingExecutor::new()).await
    }

    pub async fn with_executor(executor: RecordingExecutor) -> Self {
        let metadata = TestMetadata::new()
            .await
            .expect("Failed to create test metadata");
        let executor = Arc::new(executor);
        let lifecycle = Lifecycle::new(metadata.store(), executor.clone());

        Self {
            lifecycle,
            executor,
            metadata,
        }
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.metadata.store()
    }
}
