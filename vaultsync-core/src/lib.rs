//! VaultSync Core Library
//!
//! Keeps a per-machine vault directory synchronized across the owner's
//! machines: local change history with rollback, signed requests against a
//! registry of vault keys, per-profile exclusion rules and the push/pull
//! coordinator that ties them to a pluggable storage backend.

pub mod config;
pub mod history;
pub mod layout;
pub mod platform;
pub mod sync;
pub mod watcher;

pub use config::{ProviderConfig, VaultConfig};
pub use history::{ChangeKind, ChangeTracker, CommitOutcome, CommitSummary};
pub use layout::VaultLayout;
pub use sync::auth::AuthError;
pub use sync::engine::{PullOptions, PullOutcome, PushOutcome, SyncCoordinator, SyncPhase};
pub use sync::keys::{KeyManager, Signer};
pub use watcher::{VaultWatcher, WatcherActivity};

use thiserror::Error;

/// Result type for vault sync operations
pub type Result<T> = std::result::Result<T, VaultSyncError>;

/// General error type for vault sync operations
#[derive(Error, Debug)]
pub enum VaultSyncError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthError),

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("History error: {0}")]
    History(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("Confirmation required: {0}")]
    ConfirmationRequired(String),

    #[error("Already syncing: another sync operation holds the lock")]
    AlreadySyncing,

    #[error("A watcher is already running for this vault")]
    WatcherRunning,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VaultSyncError {
    /// Transfer failures never mutate committed state, so the caller may retry them.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transfer(_))
    }
}

impl From<serde_json::Error> for VaultSyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Failures while moving bytes to or from a relay or storage provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("relay returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("content hash mismatch (expected {expected}, got {actual})")]
    Integrity { expected: String, actual: String },

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("storage reference {0} does not belong to the requested profile")]
    ProfileMismatch(String),

    #[error("cancelled")]
    Cancelled,
}

/// Input rejected at a boundary before anything was changed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("path must not be empty")]
    EmptyPath,

    #[error("path exceeds {max} characters: {path}")]
    PathTooLong { path: String, max: usize },

    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("too many paths ({count}, limit {max})")]
    TooManyPaths { count: usize, max: usize },

    #[error("invalid profile name: {0}")]
    InvalidProfile(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}
