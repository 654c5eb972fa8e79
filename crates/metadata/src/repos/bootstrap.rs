//! Bootstrap upload-token marker repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use uuid::Uuid;

/// Tracks which token was created from the configured upload token hash, so
/// a changed hash revokes the previous token on the next start.
#[async_trait]
pub trait BootstrapRepo: Send + Sync {
    /// Get the active upload token ID, if set.
    async fn get_upload_token_id(&self) -> MetadataResult<Option<Uuid>>;

    /// Set the active upload token ID.
    async fn set_upload_token_id(&self, token_id: Uuid) -> MetadataResult<()>;
}
