//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::repos::{BootstrapRepo, ImageRepo, InstanceRepo, TokenRepo};
use crate::store::MetadataStore;
use async_trait::async_trait;
use clonedb_core::config::PgSslMode;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .map(str::trim)
        .filter(|statement| {
            statement.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            })
        })
        .collect()
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Connect using a full connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Connect using individual parameters, so the password can come from
    /// its own environment variable.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            opts = opts.ssl_mode(match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            });
        }

        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // Prepared statements cannot hold more than one command.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ImageRepo for PostgresStore {
    async fn create_image(&self, image: &NewImage) -> MetadataResult<ImageRow> {
        let row = sqlx::query_as::<_, ImageRow>(
            r#"
            INSERT INTO images (backed_up_at, anonymisation_script, ready, created_at, updated_at)
            VALUES ($1, $2, FALSE, $3, $3)
            RETURNING image_id, backed_up_at, anonymisation_script, ready, created_at, updated_at
            "#,
        )
        .bind(image.backed_up_at)
        .bind(&image.anonymisation_script)
        .bind(image.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_image(&self, image_id: i64) -> MetadataResult<Option<ImageRow>> {
        let row = sqlx::query_as::<_, ImageRow>("SELECT * FROM images WHERE image_id = $1")
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

    async fn mark_image_ready(&self, image_id: i64, at: OffsetDateTime) -> MetadataResult<bool> {
        let result = sqlx::query(
            "UPDATE images SET ready = TRUE, updated_at = $1 WHERE image_id = $2 AND ready = FALSE",
        )
        .bind(at)
        .bind(image_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_image(&self, image_id: i64) -> MetadataResult<bool> {
        let result = sqlx::query("DELETE FROM images WHERE image_id = $1")
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
impl InstanceRepo for PostgresStore {
    async fn reserve_instance_id(&self) -> MetadataResult<i64> {
        let id: i64 = sqlx::query_scalar("SELECT nextval('instance_id_seq')")
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn create_instance(&self, instance: &InstanceRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO instances (instance_id, image_id, port, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
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
        let row = sqlx::query_as::<_, InstanceRow>("SELECT * FROM instances WHERE instance_id = $1")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_instances(&self) -> MetadataResult<Vec<InstanceRow>> {
        let rows = sqlx::query_as::<_, InstanceRow>("SELECT * FROM instances ORDER BY instance_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn list_instances_for_image(&self, image_id: i64) -> MetadataResult<Vec<InstanceRow>> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            "SELECT * FROM instances WHERE image_id = $1 ORDER BY instance_id",
        )
        .bind(image_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_instance(&self, instance_id: i64) -> MetadataResult<bool> {
        let result = sqlx::query("DELETE FROM instances WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TokenRepo for PostgresStore {
    async fn create_token(&self, token: &TokenRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tokens (
                token_id, principal, principal_class, token_hash, expires_at,
                revoked_at, created_at, last_used_at, description
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
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
        let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE token_hash = $1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_token(&self, token_id: Uuid) -> MetadataResult<Option<TokenRow>> {
        let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE token_id = $1")
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn touch_token(&self, token_id: Uuid, used_at: OffsetDateTime) -> MetadataResult<()> {
        sqlx::query("UPDATE tokens SET last_used_at = $1 WHERE token_id = $2")
            .bind(used_at)
            .bind(token_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn revoke_token(&self, token_id: Uuid, revoked_at: OffsetDateTime) -> MetadataResult<()> {
        sqlx::query("UPDATE tokens SET revoked_at = $1 WHERE token_id = $2 AND revoked_at IS NULL")
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
                    "SELECT * FROM tokens WHERE principal = $1 ORDER BY created_at DESC",
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
impl BootstrapRepo for PostgresStore {
    async fn get_upload_token_id(&self) -> MetadataResult<Option<Uuid>> {
        // Outer None: no row. Inner None: row with NULL.
        let value: Option<Option<Uuid>> =
            sqlx::query_scalar("SELECT upload_token_id FROM bootstrap_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.flatten())
    }

    async fn set_upload_token_id(&self, token_id: Uuid) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bootstrap_state (id, upload_token_id)
            VALUES (1, $1)
            ON CONFLICT(id) DO UPDATE
            SET upload_token_id = EXCLUDED.upload_token_id
            "#,
        )
        .bind(token_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
