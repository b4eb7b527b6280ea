mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// VaultSync CLI - keep a vault directory in sync across your machines
#[derive(Parser)]
#[command(name = "vaultsync")]
#[command(about = "Keep a vault directory in sync across your machines", long_about = None)]
struct Cli {
    /// Vault root directory (defaults to ~/vault)
    #[arg(long, global = true, env = "VAULTSYNC_ROOT")]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize this machine's vault: layout, keypair, config and first commit
    Init {
        /// Join an existing vault instead of creating a new one
        #[arg(long)]
        vault_id: Option<uuid::Uuid>,

        /// Profile name for this machine (defaults to the hostname)
        #[arg(long)]
        profile: Option<String>,

        /// Relay base URL
        #[arg(long)]
        relay_url: Option<String>,

        /// Directory used as the filesystem storage provider
        #[arg(long)]
        storage: Option<PathBuf>,
    },

    /// Show watcher activity, last commit/push/pull and pending changes
    Status,

    /// Push, pull and control the background watcher
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },

    /// Show local commit history, newest first
    Log {
        /// Maximum number of commits to show
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show uncommitted changes
    Diff,

    /// Restore the working tree to the previous commit
    Rollback {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Manage this machine's vault key
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Inspect and switch profiles
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Manage the paths this profile keeps out of sync
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Dashboard session tokens
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand)]
pub enum SyncAction {
    /// Start the background watcher
    Start,
    /// Ask the background watcher to stop
    Stop,
    /// Commit and push this machine's tree
    Push,
    /// Pull the latest version of this machine's profile
    Pull {
        /// Overwrite local files with uncommitted changes
        #[arg(long)]
        force: bool,
    },
    /// Show watcher and storage provider status
    Status,
}

#[derive(Subcommand)]
pub enum KeyAction {
    /// Print the public key line
    Show,
    /// Print the key fingerprint
    Fingerprint,
    /// Archive the current keypair and generate a new one
    Rotate {
        #[arg(long)]
        yes: bool,
    },
    /// Check keypair consistency and file permissions
    Verify,
    /// Sign a payload and print the base64 signature
    Sign { payload: String },
    /// Register this machine's key with the relay
    Register {
        /// Session token, required for every key after a vault's first
        #[arg(long)]
        token: Option<String>,
    },
    /// Revoke a registered key
    Revoke { fingerprint: String },
}

#[derive(Subcommand)]
pub enum ProfileAction {
    /// Show this machine's profile
    Show,
    /// List every profile known to the relay
    List,
    /// Rename this machine's profile (remote history stays under the old name)
    Rename { name: String },
    /// Restore another profile's latest version into this tree
    Pull {
        name: String,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum RulesAction {
    /// Print the excluded paths
    Show {
        /// Profile to inspect (defaults to this machine's)
        #[arg(long)]
        profile: Option<String>,
    },
    /// Replace the excluded paths
    Set {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Remove every exclusion
    Clear,
}

#[derive(Subcommand)]
pub enum SessionAction {
    /// Issue a short-lived dashboard token
    Issue,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let root = cli
        .root
        .unwrap_or_else(vaultsync_core::platform::get_default_vault_root);
    let ctx = commands::Context::new(root);

    match cli.command {
        Commands::Init {
            vault_id,
            profile,
            relay_url,
            storage,
        } => commands::init(&ctx, vault_id, profile, relay_url, storage),
        Commands::Status => commands::status(&ctx),
        Commands::Sync { action } => commands::sync(&ctx, action).await,
        Commands::Log { limit } => commands::log(&ctx, limit),
        Commands::Diff => commands::diff(&ctx),
        Commands::Rollback { yes } => commands::rollback(&ctx, yes),
        Commands::Key { action } => commands::key(&ctx, action).await,
        Commands::Profile { action } => commands::profile(&ctx, action).await,
        Commands::Rules { action } => commands::rules(&ctx, action).await,
        Commands::Session { action } => commands::session(&ctx, action).await,
    }
}
