//! Vault synchronization
//!
//! - Ed25519 vault keys and signed requests over a canonical string
//! - Short-lived dashboard session tokens
//! - Per-profile exclusion rules, fetched best-effort before every push
//! - Push/pull coordinator over a pluggable storage backend
//! - Last-write-wins on pull, with uncommitted local edits reported first

pub mod auth;
pub mod backend;
pub mod client;
pub mod conflict;
pub mod engine;
pub mod keys;
pub mod lock;
pub mod models;
pub mod rules;
pub mod session;
pub mod state;
pub mod transport;

pub use backend::{FilesystemBackend, StorageBackend};
pub use client::VaultClient;
pub use conflict::ConflictResolver;
pub use models::{VaultKey, VaultVersion};

#[cfg(test)]
mod tests;
