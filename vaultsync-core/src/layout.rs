//! On-disk layout of a vault root.
//!
//! ```text
//! <root>/            shared vault tree
//! <root>/.history/   change history (objects, snapshots, index)
//! <root>/.keys/      signing keypair, owner-only
//! <root>/.local/     machine-local config, state, locks, staging
//! ```

use std::path::{Component, Path, PathBuf};

pub const HISTORY_DIR: &str = ".history";
pub const KEYS_DIR: &str = ".keys";
pub const LOCAL_DIR: &str = ".local";

/// Top-level directories that never leave the machine.
pub const RESERVED_DIRS: [&str; 3] = [HISTORY_DIR, KEYS_DIR, LOCAL_DIR];

/// Path accessors for one vault root.
#[derive(Debug, Clone)]
pub struct VaultLayout {
    root: PathBuf,
}

impl VaultLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn history_dir(&self) -> PathBuf {
        self.root.join(HISTORY_DIR)
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.root.join(KEYS_DIR)
    }

    pub fn local_dir(&self) -> PathBuf {
        self.root.join(LOCAL_DIR)
    }

    pub fn config_path(&self) -> PathBuf {
        self.local_dir().join("config.toml")
    }

    pub fn state_path(&self) -> PathBuf {
        self.local_dir().join("state.json")
    }

    pub fn sync_lock_path(&self) -> PathBuf {
        self.local_dir().join("sync.lock")
    }

    pub fn watcher_lock_path(&self) -> PathBuf {
        self.local_dir().join("watcher.lock")
    }

    pub fn heartbeat_path(&self) -> PathBuf {
        self.local_dir().join("watcher.json")
    }

    pub fn stop_request_path(&self) -> PathBuf {
        self.local_dir().join("watcher.stop")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.local_dir().join("staging")
    }

    /// Whether the vault has been initialized (config present).
    pub fn is_initialized(&self) -> bool {
        self.config_path().is_file()
    }

    /// Absolute path of a vault-relative path.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in relative.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path
    }

    /// Vault-relative path with forward slashes, or `None` for paths outside the root.
    pub fn relative(&self, absolute: &Path) -> Option<String> {
        let rel = absolute.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }
}

/// Whether a vault-relative path lives under one of the reserved directories.
pub fn is_reserved(relative: &str) -> bool {
    let first = relative.split('/').next().unwrap_or_default();
    RESERVED_DIRS.contains(&first)
}

/// Matches vault-relative paths against a list of exact paths or directory prefixes.
///
/// `notes/private` matches `notes/private` itself and everything below it,
/// but not `notes/private-2`.
#[derive(Debug, Clone, Default)]
pub struct PathMatcher {
    patterns: Vec<String>,
}

impl PathMatcher {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().trim_matches('/').to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, relative: &str) -> bool {
        self.patterns.iter().any(|pattern| {
            relative == pattern
                || relative
                    .strip_prefix(pattern.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

/// The fixed machine-local set: reserved directories plus configured local-only paths.
#[derive(Debug, Clone, Default)]
pub struct MachineLocal {
    local_only: PathMatcher,
}

impl MachineLocal {
    pub fn new(local_only: PathMatcher) -> Self {
        Self { local_only }
    }

    pub fn contains(&self, relative: &str) -> bool {
        is_reserved(relative) || self.local_only.matches(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_dirs_are_detected() {
        assert!(is_reserved(".keys/vault_ed25519"));
        assert!(is_reserved(".history"));
        assert!(is_reserved(".local/staging/abc"));
        assert!(!is_reserved("notes/.keys"));
        assert!(!is_reserved("keys.txt"));
    }

    #[test]
    fn matcher_uses_directory_prefixes() {
        let matcher = PathMatcher::new(["notes/private", "/secrets.yaml"]);
        assert!(matcher.matches("notes/private"));
        assert!(matcher.matches("notes/private/a.md"));
        assert!(!matcher.matches("notes/private-2/a.md"));
        assert!(matcher.matches("secrets.yaml"));
        assert!(!matcher.matches("config/secrets.yaml"));
    }

    #[test]
    fn relative_and_resolve_agree() {
        let layout = VaultLayout::new("/tmp/vault");
        let abs = layout.resolve("docs/readme.md");
        assert_eq!(layout.relative(&abs).as_deref(), Some("docs/readme.md"));
        assert_eq!(layout.relative(Path::new("/tmp/vault")), None);
        assert_eq!(layout.relative(Path::new("/elsewhere/file")), None);
    }

    #[test]
    fn machine_local_includes_configured_paths() {
        let local = MachineLocal::new(PathMatcher::new(["cache"]));
        assert!(local.contains("cache/thumbs.db"));
        assert!(local.contains(".keys/vault_ed25519.pub"));
        assert!(!local.contains("docs/cache.md"));
    }
}
