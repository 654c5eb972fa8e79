//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{BootstrapRepo, ImageRepo, InstanceRepo, TokenRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    ImageRepo + InstanceRepo + TokenRepo + BootstrapRepo + Send + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if missing) a SQLite store and apply the schema.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // One writer avoids "database is locked" under concurrent handlers.
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(query_timeout_secs.unwrap_or(60)))
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(path = %path.display(), "SQLite metadata store opened");
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use time::OffsetDateTime;
    use uuid::Uuid;

    #[async_trait]
    impl ImageRepo for SqliteStore {
        async fn create_image(&self, image: &NewImage) -> MetadataResult<ImageRow> {
            let row = sqlx::query_as::<_, ImageRow>(
                r#"
                INSERT INTO images (backed_up_at, anonymisation_script, ready, created_at, updated_at)
                VALUES (?, ?, 0, ?, ?)
                RETURNING image_id, backed_up_at, anonymisation_script, ready, created_at, updated_at
                "#,
            )
            .bind(image.backed_up_at)
            .bind(&image.anonymisation_script)
            .bind(image.created_at)
            .bind(image.created_at)
            .fetch_one(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_image(&self, image_id: i64) -> MetadataResult<Option<ImageRow>> {
            let row = sqlx::query_as::<_, ImageRow>("SELECT * FROM images WHERE image_id = ?")
                .bind(image_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn list_images(&self) -> MetadataResult<Vec<ImageRow>> {
            let rows = sqlx::query_as::<_, ImageRow>("SELECT * FROM images ORDER BY image_id")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn mark_image_ready(
            &self,
            image_id: i64,
            at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE images SET ready = 1, updated_at = ? WHERE image_id = ? AND ready = 0",
            )
            .bind(at)
            .bind(image_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn delete_image(&self, image_id: i64) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM images WHERE image_id = ?")
                .bind(image_id)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    MetadataError::classify(e, format!("image {image_id} still has instances"))
                })?;
            Ok(result.rows_affected() > 0)
        }
    }

    #[async_trait]
    impl InstanceRepo for SqliteStore {
        async fn reserve_instance_id(&self) -> MetadataResult<i64> {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO instance_id_reservations (reserved_at) VALUES (?) RETURNING instance_id",
            )
            .bind(OffsetDateTime::now_utc())
            .fetch_one(&self.pool)
            .await?;
            Ok(id)
        }

        async fn create_instance(&self, instance: &InstanceRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO instances (instance_id, image_id, port, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(instance.instance_id)
            .bind(instance.image_id)
            .bind(instance.port)
            .bind(instance.created_at)
            .bind(instance.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                MetadataError::classify(
                    e,
                    format!(
                        "instance {} (image {}, port {})",
                        instance.instance_id, instance.image_id, instance.port
                    ),
                )
            })?;
            Ok(())
        }

        async fn get_instance(&self, instance_id: i64) -> MetadataResult<Option<InstanceRow>> {
            let row =
                sqlx::query_as::<_, InstanceRow>("SELECT * FROM instances WHERE instance_id = ?")
                    .bind(instance_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn list_instances(&self) -> MetadataResult<Vec<InstanceRow>> {
            let rows =
                sqlx::query_as::<_, InstanceRow>("SELECT * FROM instances ORDER BY instance_id")
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows)
        }

        async fn list_instances_for_image(
            &self,
            image_id: i64,
        ) -> MetadataResult<Vec<InstanceRow>> {
            let rows = sqlx::query_as::<_, InstanceRow>(
                "SELECT * FROM instances WHERE image_id = ? ORDER BY instance_id",
            )
            .bind(image_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_instance(&self, instance_id: i64) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM instances WHERE instance_id = ?")
                .bind(instance_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }
    }

    #[async_trait]
    impl TokenRepo for SqliteStore {
        async fn create_token(&self, token: &TokenRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO tokens (
                    token_id, principal, principal_class, token_hash, expires_at,
                    revoked_at, created_at, last_used_at, description
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(token.token_id)
            .bind(&token.principal)
            .bind(&token.principal_class)
            .bind(&token.token_hash)
            .bind(token.expires_at)
            .bind(token.revoked_at)
            .bind(token.created_at)
            .bind(token.last_used_at)
            .bind(&token.description)
            .execute(&self.pool)
            .await
            .map_err(|e| MetadataError::classify(e, "token hash already registered"))?;
            Ok(())
        }

        async fn get_token_by_hash(&self, token_hash: &str) -> MetadataResult<Option<TokenRow>> {
            let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE token_hash = ?")
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_token(&self, token_id: Uuid) -> MetadataResult<Option<TokenRow>> {
            let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE token_id = ?")
                .bind(token_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn touch_token(&self, token_id: Uuid, used_at: OffsetDateTime) -> MetadataResult<()> {
            sqlx::query("UPDATE tokens SET last_used_at = ? WHERE token_id = ?")
                .bind(used_at)
                .bind(token_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn revoke_token(
            &self,
            token_id: Uuid,
            revoked_at: OffsetDateTime,
        ) -> MetadataResult<()> {
            sqlx::query("UPDATE tokens SET revoked_at = ? WHERE token_id = ? AND revoked_at IS NULL")
                .bind(revoked_at)
                .bind(token_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn list_tokens(&self, principal: Option<&str>) -> MetadataResult<Vec<TokenRow>> {
            let rows = match principal {
                Some(principal) => {
                    sqlx::query_as::<_, TokenRow>(
                        "SELECT * FROM tokens WHERE principal = ? ORDER BY created_at DESC",
                    )
                    .bind(principal)
                    .fetch_all(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens ORDER BY created_at DESC")
                        .fetch_all(&self.pool)
                        .await?
                }
            };
            Ok(rows)
        }
    }

    #[async_trait]
    impl BootstrapRepo for SqliteStore {
        async fn get_upload_token_id(&self) -> MetadataResult<Option<Uuid>> {
            let value: Option<Option<String>> =
                sqlx::query_scalar("SELECT upload_token_id FROM bootstrap_state WHERE id = 1")
                    .fetch_optional(&self.pool)
                    .await?;
            value
                .flatten()
                .filter(|id| !id.is_empty())
                .map(|id| {
                    Uuid::parse_str(&id).map_err(|e| {
                        MetadataError::Internal(format!("invalid upload_token_id uuid '{id}': {e}"))
                    })
                })
                .transpose()
        }

        async fn set_upload_token_id(&self, token_id: Uuid) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO bootstrap_state (id, upload_token_id)
                VALUES (1, ?)
                ON CONFLICT(id) DO UPDATE
                SET upload_token_id = excluded.upload_token_id
                "#,
            )
            .bind(token_id.to_string())
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
-- AUTOINCREMENT keeps image ids from being reused after deletes.
CREATE TABLE IF NOT EXISTS images (
    image_id INTEGER PRIMARY KEY AUTOINCREMENT,
    backed_up_at TEXT NOT NULL,
    anonymisation_script BLOB NOT NULL,
    ready INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS instance_id_reservations (
    instance_id INTEGER PRIMARY KEY AUTOINCREMENT,
    reserved_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS instances (
    instance_id INTEGER PRIMARY KEY,
    image_id INTEGER NOT NULL REFERENCES images(image_id),
    port INTEGER NOT NULL UNIQUE,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_instances_image ON instances(image_id);

CREATE TABLE IF NOT EXISTS tokens (
    token_id BLOB PRIMARY KEY,
    principal TEXT NOT NULL,
    principal_class TEXT NOT NULL CHECK (principal_class IN ('ordinary', 'upload')),
    token_hash TEXT NOT NULL UNIQUE,
    expires_at TEXT,
    revoked_at TEXT,
    created_at TEXT NOT NULL,
    last_used_at TEXT,
    description TEXT
);
CREATE INDEX IF NOT EXISTS idx_tokens_principal ON tokens(principal);

CREATE TABLE IF NOT EXISTS bootstrap_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    upload_token_id TEXT
);
"#;
