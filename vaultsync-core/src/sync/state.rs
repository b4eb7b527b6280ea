//! Sync bookkeeping for this machine, stored in `.local/state.json`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::layout::VaultLayout;
use crate::{platform, Result, VaultSyncError};

/// Timestamps and pointers of the last successful push and pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_push_at: Option<i64>,
    pub last_pushed_hash: Option<String>,
    pub last_pushed_version: Option<Uuid>,
    pub last_pull_at: Option<i64>,
    pub last_pulled_profile: Option<String>,
    pub last_pulled_version: Option<Uuid>,
}

impl SyncState {
    /// Load sync state. Returns default if the file does not exist yet.
    pub fn load(layout: &VaultLayout) -> Result<Self> {
        match std::fs::read(layout.state_path()) {
            Ok(json) => serde_json::from_slice(&json)
                .map_err(|e| VaultSyncError::Serialization(format!("corrupt sync state: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Save sync state atomically.
    pub fn save(&self, layout: &VaultLayout) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        platform::write_atomic(&layout.state_path(), &json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state() {
        let state = SyncState::default();
        assert!(state.last_push_at.is_none());
        assert!(state.last_pulled_profile.is_none());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let layout = VaultLayout::new(dir.path());
        assert_eq!(SyncState::load(&layout).unwrap(), SyncState::default());

        let state = SyncState {
            last_push_at: Some(42),
            last_pushed_hash: Some("abc".to_string()),
            ..Default::default()
        };
        state.save(&layout).unwrap();
        assert_eq!(SyncState::load(&layout).unwrap(), state);
    }
}
