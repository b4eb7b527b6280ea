//! VaultSync Relay Server
//!
//! The managed backend for vault sync: a registry of vault public keys,
//! per-profile sync rules, immutable version records and short-lived
//! dashboard sessions. File contents never pass through the relay; they go
//! to the configured storage provider.

mod auth;
mod cleanup;
mod config;
mod error;
mod handlers;
mod server;
mod storage;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "vaultsync-relay", about = "VaultSync relay server")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Listen address override
    #[arg(short, long)]
    listen: Option<String>,

    /// Database path override
    #[arg(short, long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut cfg = if cli.config.exists() {
        config::RelayConfig::load(&cli.config)?
    } else {
        tracing::info!("No config file found, using defaults");
        config::RelayConfig::default()
    };

    if let Some(listen) = cli.listen {
        cfg.listen_addr = listen;
    }
    if let Some(database) = cli.database {
        cfg.storage_path = database;
    }

    tracing::info!(
        listen = %cfg.listen_addr,
        database = %cfg.storage_path.display(),
        "Starting VaultSync relay"
    );

    let storage = storage::RelayStorage::open(&cfg.storage_path)?;
    let cleanup = cleanup::spawn_cleanup_task(storage.clone(), cfg.cleanup_interval_secs);
    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    let app = server::build_router(storage, cfg);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
        })
        .await?;

    cleanup.abort();
    Ok(())
}
