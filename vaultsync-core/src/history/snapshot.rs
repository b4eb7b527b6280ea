//! Snapshot model and working-tree scanning.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::history::store::hash_file;
use crate::layout::{MachineLocal, VaultLayout};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Change {
    pub path: String,
    pub kind: ChangeKind,
}

/// What produced a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CommitOrigin {
    Init,
    Local,
    Pull { profile: String },
}

impl std::fmt::Display for CommitOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Local => write!(f, "local"),
            Self::Pull { profile } => write!(f, "pull from {}", profile),
        }
    }
}

/// One tracked file in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub hash: String,
    pub size: u64,
    pub modified_secs: i64,
    pub modified_nanos: u32,
    #[serde(default)]
    pub mode: Option<u32>,
}

/// Full state of the shared tree at one commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub parent: Option<Uuid>,
    pub created_at: i64,
    pub hostname: String,
    pub origin: CommitOrigin,
    pub entries: BTreeMap<String, FileEntry>,
    pub changes: Vec<Change>,
}

impl Snapshot {
    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }
}

/// Index entry for one commit; enough for `log` without reading snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: Uuid,
    pub parent: Option<Uuid>,
    pub created_at: i64,
    pub hostname: String,
    pub origin: CommitOrigin,
    pub changed_paths: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryIndex {
    pub head: Option<Uuid>,
    /// Oldest first. Never truncated.
    pub commits: Vec<CommitRecord>,
}

/// A file found while scanning the working tree.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub size: u64,
    pub modified_secs: i64,
    pub modified_nanos: u32,
    pub mode: Option<u32>,
    /// Reused from the base snapshot when size and mtime are unchanged.
    pub hash: String,
}

/// Result of comparing the working tree to a base snapshot.
#[derive(Debug, Clone, Default)]
pub struct TreeScan {
    pub files: BTreeMap<String, ScannedFile>,
    /// Sorted by path.
    pub changes: Vec<Change>,
}

impl TreeScan {
    pub fn changed_paths(&self) -> BTreeSet<&str> {
        self.changes.iter().map(|c| c.path.as_str()).collect()
    }
}

/// Walk the shared tree and diff it against `base` entries.
pub fn scan_tree(
    layout: &VaultLayout,
    machine_local: &MachineLocal,
    base: &BTreeMap<String, FileEntry>,
) -> Result<TreeScan> {
    let root = layout.root();
    let mut files = BTreeMap::new();
    let mut changes = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| match layout.relative(entry.path()) {
            Some(rel) => !machine_local.contains(&rel),
            None => true,
        });

    for entry in walker {
        let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
        if !entry.file_type().is_file() {
            if entry.file_type().is_symlink() {
                debug!(path = %entry.path().display(), "Skipping symlink");
            }
            continue;
        }
        let Some(rel) = layout.relative(entry.path()) else {
            continue;
        };
        let metadata = entry.metadata().map_err(|e| std::io::Error::other(e.to_string()))?;
        let (modified_secs, modified_nanos) = mtime(&metadata);
        let mode = file_mode(&metadata);
        let size = metadata.len();

        let hash = match base.get(&rel) {
            Some(prev)
                if prev.size == size
                    && prev.modified_secs == modified_secs
                    && prev.modified_nanos == modified_nanos =>
            {
                prev.hash.clone()
            }
            _ => hash_file(entry.path())?.0,
        };

        match base.get(&rel) {
            None => changes.push(Change {
                path: rel.clone(),
                kind: ChangeKind::Added,
            }),
            Some(prev) if prev.hash != hash => changes.push(Change {
                path: rel.clone(),
                kind: ChangeKind::Modified,
            }),
            Some(_) => {}
        }

        files.insert(
            rel,
            ScannedFile {
                size,
                modified_secs,
                modified_nanos,
                mode,
                hash,
            },
        );
    }

    for path in base.keys() {
        if !files.contains_key(path) && !machine_local.contains(path) {
            changes.push(Change {
                path: path.clone(),
                kind: ChangeKind::Deleted,
            });
        }
    }
    changes.sort();

    Ok(TreeScan { files, changes })
}

fn mtime(metadata: &std::fs::Metadata) -> (i64, u32) {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| (d.as_secs() as i64, d.subsec_nanos()))
        .unwrap_or((0, 0))
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> Option<u32> {
    None
}

/// Remove empty directories between `path`'s parent and `stop`, exclusive.
pub fn prune_empty_dirs(path: &Path, stop: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == stop || !dir.starts_with(stop) {
            break;
        }
        if std::fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}
