//! clonedb server binary.

use anyhow::{Context, Result};
use clap::Parser;
use clonedb_core::config::AppConfig;
use clonedb_server::bootstrap::ensure_tokens;
use clonedb_server::{AppState, create_router};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// clonedb - database image and instance provisioning
#[derive(Parser, Debug)]
#[command(name = "clonedbd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "CLONEDB_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,
}

/// Load configuration from an optional TOML file and `CLONEDB_` env vars.
fn load_config(path: &str) -> Result<AppConfig> {
    let config_path = std::path::Path::new(path);
    let mut figment = Figment::new();
    let has_config_file = config_path.exists();

    if has_config_file {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path);
    }

    // CLONEDB_CONFIG only names the file
    let has_env_config =
        std::env::vars().any(|(key, _)| key.starts_with("CLONEDB_") && key != "CLONEDB_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: clonedbd --config /path/to/config.toml\n  \
             2. Environment variables: CLONEDB_SERVER__BIND=0.0.0.0:8443 \
             CLONEDB_AUTH__UPLOAD_TOKEN_HASH=sha256:YOUR_TOKEN_HASH_HERE clonedbd\n\n\
             See config/server.example.toml for example configuration.\n\
             Set CLONEDB_CONFIG env var to specify a default config file path."
        );
    }

    if !has_config_file {
        tracing::info!("Using environment variables for configuration");
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("CLONEDB_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("clonedb v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    clonedb_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let metadata = clonedb_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    ensure_tokens(metadata.as_ref(), &config.auth).await?;

    let executor = clonedb_exec::from_config(&config.executor)
        .await
        .context("failed to initialize executor")?;

    // Refuse to serve when the data root is unusable.
    executor
        .health_check()
        .await
        .context("executor health check failed")?;
    tracing::info!(backend = executor.backend_name(), "Executor initialized");

    let live = metadata
        .list_instances()
        .await
        .context("failed to count instances")?
        .len();
    clonedb_server::metrics::LIVE_INSTANCES.set(i64::try_from(live).unwrap_or(i64::MAX));

    let state = AppState::new(config.clone(), metadata, executor);
    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}
