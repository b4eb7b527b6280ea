//! Relay server configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub storage_path: PathBuf,
    pub max_payload_size: usize,
    pub timestamp_tolerance_secs: i64,
    pub session_ttl_secs: i64,
    pub max_rules_per_profile: usize,
    pub cleanup_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8743".to_string(),
            storage_path: PathBuf::from("relay.db"),
            max_payload_size: 1024 * 1024,
            timestamp_tolerance_secs: 300,
            session_ttl_secs: 900,
            max_rules_per_profile: 10_000,
            cleanup_interval_secs: 3600,
        }
    }
}

impl RelayConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }
}
