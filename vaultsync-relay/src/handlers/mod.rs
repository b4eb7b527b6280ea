//! HTTP handlers for the relay API.

pub mod keys;
pub mod rules;
pub mod sessions;
pub mod versions;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::storage::RelayStorage;
use std::sync::Arc;
use uuid::Uuid;
use vaultsync_core::config::validate_profile_name;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub storage: RelayStorage,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(storage: RelayStorage, config: RelayConfig) -> Self {
        Self {
            storage,
            config: Arc::new(config),
        }
    }
}

pub(crate) fn parse_vault_id(raw: &str) -> Result<Uuid, RelayError> {
    Uuid::parse_str(raw).map_err(|_| RelayError::BadRequest(format!("Invalid vault id: {}", raw)))
}

pub(crate) fn check_profile(profile: &str) -> Result<(), RelayError> {
    validate_profile_name(profile)?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    AppState::new(
        RelayStorage::in_memory().unwrap(),
        RelayConfig::default(),
    )
}
