//! Token initialization from configuration.

use anyhow::{Context, Result, bail};
use clonedb_core::PrincipalClass;
use clonedb_core::config::AuthConfig;
use clonedb_core::token::normalize_token_hash;
use clonedb_metadata::MetadataStore;
use clonedb_metadata::models::TokenRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Ensure every configured token exists.
pub async fn ensure_tokens(metadata: &dyn MetadataStore, config: &AuthConfig) -> Result<()> {
    ensure_upload_token(metadata, config).await?;
    ensure_principal_tokens(metadata, config).await
}

/// Ensure the configured upload token exists, rotating the previous one if needed.
///
/// If the token hash changes between restarts, the previous upload token is
/// revoked and a new one is created with the new hash.
pub async fn ensure_upload_token(metadata: &dyn MetadataStore, config: &AuthConfig) -> Result<()> {
    let hash = normalize_token_hash(&config.upload_token_hash)
        .context("invalid auth.upload_token_hash")?;

    if let Some(existing) = metadata.get_token_by_hash(&hash).await? {
        reject_unusable(&existing, "upload")?;
        if existing.principal_class != PrincipalClass::Upload.as_str() {
            bail!(
                "upload token hash is already bound to ordinary principal {} (id={})",
                existing.principal,
                existing.token_id
            );
        }
        metadata.set_upload_token_id(existing.token_id).await?;
        tracing::debug!("Upload token already exists");
        return Ok(());
    }

    let now = OffsetDateTime::now_utc();
    if let Some(prev_id) = metadata.get_upload_token_id().await? {
        metadata.revoke_token(prev_id, now).await?;
        tracing::info!(token_id = %prev_id, "Previous upload token revoked");
    }

    let token = new_token_row(
        &config.upload_principal,
        PrincipalClass::Upload,
        hash,
        now,
        "upload principal (configured)",
    );
    metadata.create_token(&token).await?;
    metadata.set_upload_token_id(token.token_id).await?;
    tracing::info!(token_id = %token.token_id, principal = %token.principal, "Upload token created");

    Ok(())
}

/// Ensure a token exists for each configured ordinary principal.
///
/// Tokens removed from configuration are left alone; revoke them through
/// the store.
pub async fn ensure_principal_tokens(
    metadata: &dyn MetadataStore,
    config: &AuthConfig,
) -> Result<()> {
    for entry in &config.principals {
        let hash = normalize_token_hash(&entry.token_hash)
            .with_context(|| format!("invalid token_hash for principal {}", entry.identity))?;

        if let Some(existing) = metadata.get_token_by_hash(&hash).await? {
            reject_unusable(&existing, &entry.identity)?;
            if existing.principal != entry.identity
                || existing.principal_class != PrincipalClass::Ordinary.as_str()
            {
                bail!(
                    "token hash for principal {} is already bound to {} ({})",
                    entry.identity,
                    existing.principal,
                    existing.principal_class
                );
            }
            tracing::debug!(principal = %entry.identity, "Principal token already exists");
            continue;
        }

        let token = new_token_row(
            &entry.identity,
            PrincipalClass::Ordinary,
            hash,
            OffsetDateTime::now_utc(),
            "ordinary principal (configured)",
        );
        metadata.create_token(&token).await?;
        tracing::info!(token_id = %token.token_id, principal = %entry.identity, "Principal token created");
    }
    Ok(())
}

/// Refuse configured hashes that match a revoked or expired token.
fn reject_unusable(existing: &TokenRow, who: &str) -> Result<()> {
    if existing.revoked_at.is_some() {
        bail!(
            "{who} token hash matches a revoked token (id={}); \
             use a new token hash",
            existing.token_id
        );
    }
    if let Some(expires_at) = existing.expires_at
        && expires_at <= OffsetDateTime::now_utc()
    {
        bail!(
            "{who} token hash matches an expired token (id={}, expired={}); \
             use a new token hash",
            existing.token_id,
            expires_at
        );
    }
    Ok(())
}

fn new_token_row(
    principal: &str,
    class: PrincipalClass,
    token_hash: String,
    now: OffsetDateTime,
    description: &str,
) -> TokenRow {
    TokenRow {
        token_id: Uuid::new_v4(),
        principal: principal.to_string(),
        principal_class: class.as_str().to_string(),
        token_hash,
        expires_at: None,
        revoked_at: None,
        created_at: now,
        last_used_at: None,
        description: Some(description.to_string()),
    }
}
