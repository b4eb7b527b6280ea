use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vaultsync_core::{SyncCoordinator, VaultConfig, VaultLayout, VaultSyncError, VaultWatcher};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "vaultsync-daemon", about = "VaultSync background watcher")]
struct Cli {
    /// Vault root directory (defaults to ~/vault)
    #[arg(long, env = "VAULTSYNC_ROOT")]
    root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let root = cli
        .root
        .unwrap_or_else(vaultsync_core::platform::get_default_vault_root);
    let layout = VaultLayout::new(root);

    info!("Starting VaultSync daemon v{}", VERSION);

    let config = VaultConfig::load(&layout)?;
    let coordinator = Arc::new(SyncCoordinator::from_config(&layout, config)?);
    let watcher = VaultWatcher::new(coordinator);

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    match watcher.run(shutdown).await {
        Ok(()) => Ok(()),
        Err(VaultSyncError::WatcherRunning) => {
            info!(root = %layout.root().display(), "A watcher is already running for this vault");
            Ok(())
        }
        Err(e) => {
            error!("Watcher failed: {}", e);
            Err(e.into())
        }
    }
}
