//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8443").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    /// The endpoint is unauthenticated; restrict it at the network level.
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    /// Require the `Clonedb-Version` header on authenticated routes (default: true).
    #[serde(default = "default_true")]
    pub require_api_version: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8443".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_enabled: true,
            require_api_version: true,
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Entity store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (single-node deployments and tests).
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Query timeout in seconds. Advisory only: SQLite cannot cancel a
        /// running statement.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL. Takes precedence over individual fields.
        url: Option<String>,
        host: Option<String>,
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        username: Option<String>,
        /// Prefer CLONEDB_METADATA__PASSWORD over storing this in a file.
        password: Option<String>,
        database: Option<String>,
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(30_000)
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(60)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/clonedb.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                ..
            } => match (url.as_ref(), host.as_ref(), database.as_ref()) {
                (Some(_), _, _) | (None, Some(_), Some(_)) => Ok(()),
                (None, None, _) => {
                    Err("postgres config requires either 'url' or 'host' + 'database'".to_string())
                }
                (None, Some(_), None) => Err(
                    "postgres config requires 'database' when using individual fields".to_string(),
                ),
            },
        }
    }
}

/// How image and instance subvolumes are materialised on the host.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubvolumeDriverKind {
    /// btrfs subvolumes and snapshots (production).
    #[default]
    Btrfs,
    /// Plain directories with full copies (development and tests).
    Directory,
}

/// Host executor configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Data root holding `image_uploads/`, `images/` and `instances/`.
    #[serde(default = "default_executor_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub driver: SubvolumeDriverKind,
    /// Database server argv. `{data_dir}` and `{port}` are substituted and
    /// both must appear.
    #[serde(default = "default_server_command")]
    pub server_command: Vec<String>,
    /// Script run as `<script> <data_dir> <port>` before the server starts.
    /// Exit status 3 means the directory is not a valid data directory.
    #[serde(default)]
    pub provision_script: Option<PathBuf>,
    /// Script run as `<script> <upload_dir> <anonymisation_script_file>`
    /// when an image is finalised.
    #[serde(default)]
    pub finalise_script: Option<PathBuf>,
    /// First port handed to instances (inclusive).
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    /// Last port handed to instances (inclusive).
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    /// How long a new instance may take to accept connections.
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL when stopping an instance.
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    /// Upper bound on provisioning and finalise script runtime.
    #[serde(default = "default_script_timeout_secs")]
    pub script_timeout_secs: u64,
}

fn default_executor_root() -> PathBuf {
    PathBuf::from("/var/lib/clonedb")
}

fn default_server_command() -> Vec<String> {
    [
        "postgres",
        "-D",
        "{data_dir}",
        "-p",
        "{port}",
        "-c",
        "listen_addresses=127.0.0.1",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_port_range_start() -> u16 {
    5433
}

fn default_port_range_end() -> u16 {
    6000
}

fn default_ready_timeout_secs() -> u64 {
    60
}

fn default_stop_grace_secs() -> u64 {
    30
}

fn default_script_timeout_secs() -> u64 {
    3600
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            root: default_executor_root(),
            driver: SubvolumeDriverKind::default(),
            server_command: default_server_command(),
            provision_script: None,
            finalise_script: None,
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            ready_timeout_secs: default_ready_timeout_secs(),
            stop_grace_secs: default_stop_grace_secs(),
            script_timeout_secs: default_script_timeout_secs(),
        }
    }
}

impl ExecutorConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }

    /// Validate executor configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.port_range_start == 0 || self.port_range_start > self.port_range_end {
            return Err(format!(
                "executor port range {}-{} is empty",
                self.port_range_start, self.port_range_end
            ));
        }
        if self.server_command.is_empty() {
            return Err("executor.server_command cannot be empty".to_string());
        }
        if !self.server_command.iter().any(|arg| arg.contains("{port}")) {
            return Err("executor.server_command must reference {port}".to_string());
        }
        // Recorded pids are matched back to their instance by data directory.
        if !self.server_command.iter().any(|arg| arg.contains("{data_dir}")) {
            return Err("executor.server_command must reference {data_dir}".to_string());
        }
        if self.ready_timeout_secs == 0 {
            return Err("executor.ready_timeout_secs must be greater than 0".to_string());
        }
        if self.script_timeout_secs == 0 {
            return Err("executor.script_timeout_secs must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Token configuration for one ordinary principal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrincipalTokenConfig {
    /// Identity the token authenticates as.
    pub identity: String,
    /// SHA256 hex of the bearer secret.
    pub token_hash: String,
}

/// Authentication configuration.
///
/// The upload token is required. If its hash changes between restarts the
/// previous upload token is revoked and a new one is created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    /// SHA256 hex of the upload principal's bearer secret.
    /// Generate with: `echo -n "your-secret-token" | sha256sum`
    pub upload_token_hash: String,
    /// Identity reported for the upload principal.
    #[serde(default = "default_upload_principal")]
    pub upload_principal: String,
    /// Ordinary principals.
    #[serde(default)]
    pub principals: Vec<PrincipalTokenConfig>,
}

fn default_upload_principal() -> String {
    "upload".to_string()
}

impl AuthConfig {
    /// Create a test configuration.
    ///
    /// **For testing only.** Upload secret is "test-upload-token", the single
    /// ordinary principal's secret is "test-user-token".
    pub fn for_testing() -> Self {
        Self {
            // SHA256 of "test-upload-token"
            upload_token_hash: "38d3354f54fb6756e59f735cc2ef6f71e5b4d3f85382190722ca28b328352b3c"
                .to_string(),
            upload_principal: default_upload_principal(),
            principals: vec![PrincipalTokenConfig {
                identity: "user@example.com".to_string(),
                // SHA256 of "test-user-token"
                token_hash: "19bbb7d9c45e18a41bced9a036616e2ed096ec57adf02379c46b98edf356b156"
                    .to_string(),
            }],
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Authentication configuration (required).
    pub auth: AuthConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses SQLite metadata, the directory driver
    /// and fixed test tokens.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            metadata: MetadataConfig::default(),
            executor: ExecutorConfig {
                driver: SubvolumeDriverKind::Directory,
                ..ExecutorConfig::default()
            },
            auth: AuthConfig::for_testing(),
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.metadata.validate()?;
        self.executor.validate()?;
        Ok(())
    }
}
