//! Per-machine vault configuration, stored in `.local/config.toml`.
//!
//! Loaded and validated once per process, then passed by reference into
//! each component.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::layout::VaultLayout;
use crate::{platform, Result, ValidationError, VaultSyncError};

pub const MAX_PROFILE_LEN: usize = 64;

fn default_request_timeout() -> u64 {
    30
}

fn default_transfer_timeout() -> u64 {
    300
}

fn default_quiescence_ms() -> u64 {
    2000
}

/// Storage provider selection. Each variant carries exactly the settings that provider needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    #[default]
    Unconfigured,
    /// A directory on local disk or a mounted remote filesystem.
    Filesystem { path: PathBuf },
}

impl ProviderConfig {
    fn validate(&self) -> Result<()> {
        match self {
            Self::Unconfigured => Ok(()),
            Self::Filesystem { path } => {
                if path.as_os_str().is_empty() {
                    return Err(VaultSyncError::Configuration(
                        "filesystem provider requires a path".to_string(),
                    ));
                }
                if !path.is_absolute() {
                    return Err(VaultSyncError::Configuration(format!(
                        "filesystem provider path must be absolute: {}",
                        path.display()
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Vault configuration for this machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    pub vault_id: Uuid,
    pub profile: String,
    pub hostname: String,
    pub instance_id: Uuid,
    #[serde(default)]
    pub relay_url: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,
    #[serde(default = "default_quiescence_ms")]
    pub quiescence_ms: u64,
    #[serde(default)]
    pub auto_push: bool,
    /// Paths (exact or directory prefix) that never leave this machine.
    #[serde(default)]
    pub local_only: Vec<String>,
    #[serde(default)]
    pub provider: ProviderConfig,
}

impl VaultConfig {
    /// Fresh configuration for a new vault, profile defaulting to the hostname.
    pub fn new(vault_id: Uuid) -> Self {
        let hostname = platform::get_hostname();
        Self {
            vault_id,
            profile: sanitize_profile(&hostname),
            hostname,
            instance_id: Uuid::new_v4(),
            relay_url: None,
            request_timeout_secs: default_request_timeout(),
            transfer_timeout_secs: default_transfer_timeout(),
            quiescence_ms: default_quiescence_ms(),
            auto_push: false,
            local_only: Vec::new(),
            provider: ProviderConfig::Unconfigured,
        }
    }

    /// Load and validate the config of an initialized vault.
    pub fn load(layout: &VaultLayout) -> Result<Self> {
        Self::load_from(&layout.config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultSyncError::Configuration(format!(
                    "vault not initialized (missing {}); run `vaultsync init`",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let config: Self = toml::from_str(&content).map_err(|e| {
            VaultSyncError::Configuration(format!("invalid {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field once; components trust a loaded config afterwards.
    pub fn validate(&self) -> Result<()> {
        validate_profile_name(&self.profile)?;
        if self.request_timeout_secs == 0 || self.transfer_timeout_secs == 0 {
            return Err(VaultSyncError::Configuration(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if let Some(url) = &self.relay_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(VaultSyncError::Configuration(format!(
                    "relay_url must be an http(s) URL: {}",
                    url
                )));
            }
        }
        for path in &self.local_only {
            crate::sync::rules::validate_path(path)?;
        }
        self.provider.validate()
    }

    pub fn save(&self, layout: &VaultLayout) -> Result<()> {
        self.validate()?;
        let content = toml::to_string_pretty(self)
            .map_err(|e| VaultSyncError::Serialization(e.to_string()))?;
        platform::write_atomic(&layout.config_path(), content.as_bytes())?;
        Ok(())
    }

    pub fn relay_url(&self) -> Result<&str> {
        self.relay_url.as_deref().ok_or_else(|| {
            VaultSyncError::Configuration("relay_url is not configured".to_string())
        })
    }
}

/// Profile names: 1-64 characters from `[A-Za-z0-9._-]`.
pub fn validate_profile_name(name: &str) -> std::result::Result<(), ValidationError> {
    if name.is_empty() || name.len() > MAX_PROFILE_LEN {
        return Err(ValidationError::InvalidProfile(name.to_string()));
    }
    if name == "." || name == ".." {
        return Err(ValidationError::InvalidProfile(name.to_string()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(ValidationError::InvalidProfile(name.to_string()));
    }
    Ok(())
}

fn sanitize_profile(hostname: &str) -> String {
    let cleaned: String = hostname
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .take(MAX_PROFILE_LEN)
        .collect();
    if validate_profile_name(&cleaned).is_ok() {
        cleaned
    } else {
        "default".to_string()
    }
}
