//! Content-addressed object store and snapshot/index persistence under `.history/`.
//!
//! ```text
//! .history/objects/<2 hex>/<sha256>   file contents, immutable
//! .history/snapshots/<uuid>.json      full tree snapshots, immutable
//! .history/index.json                 head pointer + commit records
//! .history/staging/                   in-flight object copies
//! ```
//!
//! New data is always written to a temporary file and renamed into place.
//! The index is written last, so a crash mid-commit leaves at most an
//! unreferenced object or snapshot behind.

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

use crate::history::snapshot::{HistoryIndex, Snapshot};
use crate::{platform, Result, VaultSyncError};

const CHUNK_SIZE: usize = 64 * 1024;

pub struct HistoryStore {
    root: PathBuf,
    objects_root: PathBuf,
    snapshots_root: PathBuf,
    staging_root: PathBuf,
}

impl HistoryStore {
    /// Open (creating if needed) the store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let objects_root = root.join("objects");
        let snapshots_root = root.join("snapshots");
        let staging_root = root.join("staging");

        fs::create_dir_all(&objects_root)?;
        fs::create_dir_all(&snapshots_root)?;
        fs::create_dir_all(&staging_root)?;

        Self::cleanup_staging_dir(&staging_root);

        Ok(Self {
            root,
            objects_root,
            snapshots_root,
            staging_root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of an object. Anything but a sha256 hex digest is rejected.
    pub fn object_path(&self, hash: &str) -> Result<PathBuf> {
        if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(VaultSyncError::History(format!(
                "invalid object hash {:?}",
                hash
            )));
        }
        Ok(self.objects_root.join(&hash[..2]).join(hash))
    }

    pub fn has_object(&self, hash: &str) -> bool {
        self.object_path(hash).is_ok_and(|path| path.is_file())
    }

    /// Copy a working-tree file into the store, hashing while copying.
    ///
    /// Returns the hash and size of the bytes actually stored.
    pub fn store_file(&self, source: &Path) -> Result<(String, u64)> {
        let mut input = File::open(source)?;
        let mut staged = tempfile::Builder::new()
            .suffix(".staging")
            .tempfile_in(&self.staging_root)?;

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = input.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            staged.write_all(&buf[..n])?;
            size += n as u64;
        }
        let hash = hex::encode(hasher.finalize());

        let dest = self.object_path(&hash)?;
        if dest.is_file() {
            return Ok((hash, size));
        }
        staged.as_file().sync_all()?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        staged.persist(&dest).map_err(|e| e.error)?;
        Ok((hash, size))
    }

    /// Write an object's bytes to `dest` via a sibling temp file, verifying the hash first.
    pub fn restore_object(&self, hash: &str, dest: &Path) -> Result<()> {
        let source = self.object_path(hash)?;
        if !source.is_file() {
            return Err(VaultSyncError::History(format!("object {} is missing", hash)));
        }
        let parent = dest
            .parent()
            .ok_or_else(|| VaultSyncError::History(format!("bad restore target {}", dest.display())))?;
        fs::create_dir_all(parent)?;

        let mut input = File::open(&source)?;
        let mut staged = tempfile::NamedTempFile::new_in(parent)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = input.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            staged.write_all(&buf[..n])?;
        }
        let actual = hex::encode(hasher.finalize());
        if actual != hash {
            return Err(VaultSyncError::History(format!(
                "object {} is corrupted (content hashes to {})",
                hash, actual
            )));
        }
        staged.as_file().sync_all()?;
        staged.persist(dest).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn write_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        platform::write_atomic(&self.snapshot_path(&snapshot.id), &json)?;
        Ok(())
    }

    pub fn read_snapshot(&self, id: &Uuid) -> Result<Snapshot> {
        let path = self.snapshot_path(id);
        let json = fs::read(&path).map_err(|e| {
            VaultSyncError::History(format!("cannot read snapshot {}: {}", id, e))
        })?;
        serde_json::from_slice(&json)
            .map_err(|e| VaultSyncError::History(format!("corrupt snapshot {}: {}", id, e)))
    }

    /// The index, or an empty one for a fresh store.
    pub fn read_index(&self) -> Result<HistoryIndex> {
        let path = self.index_path();
        match fs::read(&path) {
            Ok(json) => serde_json::from_slice(&json)
                .map_err(|e| VaultSyncError::History(format!("corrupt history index: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HistoryIndex::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_index(&self, index: &HistoryIndex) -> Result<()> {
        let json = serde_json::to_vec_pretty(index)?;
        platform::write_atomic(&self.index_path(), &json)?;
        Ok(())
    }

    fn snapshot_path(&self, id: &Uuid) -> PathBuf {
        self.snapshots_root.join(format!("{}.json", id))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    /// Remove any leftover `.staging` files from a previous crash.
    fn cleanup_staging_dir(staging_root: &Path) {
        if let Ok(entries) = fs::read_dir(staging_root) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if name.to_string_lossy().ends_with(".staging") {
                    warn!(path = %entry.path().display(), "Removing orphaned history staging file");
                    if let Err(e) = fs::remove_file(entry.path()) {
                        warn!(path = %entry.path().display(), error = %e, "Could not remove staging file");
                    }
                }
            }
        }
    }
}

/// Streaming SHA-256 of a file. Returns hex digest and size.
pub fn hash_file(path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// Hex SHA-256 of an in-memory buffer.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
