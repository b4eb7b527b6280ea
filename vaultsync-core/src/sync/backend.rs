//! Storage backend contract and the filesystem provider.
//!
//! A backend moves an already-filtered [`TransferSet`] to remote storage and
//! brings a stored snapshot back into a local staging directory. Backends are
//! blocking; the coordinator runs them on the blocking pool under a timeout.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ProviderConfig;
use crate::sync::rules::validate_path;
use crate::sync::transport::Credentials;
use crate::{Result, TransferError, VaultSyncError};

const CHUNK_SIZE: usize = 64 * 1024;
const MANIFEST_FILE: &str = "SNAPSHOT.json";
const FILES_DIR: &str = "files";
const INCOMING_DIR: &str = ".incoming";

/// One file to transfer. `source` is the immutable history object holding its bytes.
#[derive(Debug, Clone)]
pub struct TransferFile {
    pub path: String,
    pub source: PathBuf,
    pub hash: String,
    pub size: u64,
}

/// The filtered file set of one push.
#[derive(Debug, Clone)]
pub struct TransferSet {
    pub profile: String,
    pub snapshot_id: Uuid,
    /// Sorted by path.
    pub files: Vec<TransferFile>,
    /// Paths left out because of the profile's exclusion rules.
    pub excluded: Vec<String>,
}

impl TransferSet {
    /// Hash over the sorted (path, hash, size) list; equal trees give equal hashes.
    pub fn content_hash(&self) -> String {
        content_hash_of(
            self.files
                .iter()
                .map(|f| (f.path.as_str(), f.hash.as_str(), f.size)),
        )
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.iter().any(|f| f.path == path)
    }
}

/// Content hash of a file list. Entries must be sorted by path.
pub fn content_hash_of<'a>(entries: impl Iterator<Item = (&'a str, &'a str, u64)>) -> String {
    let mut hasher = Sha256::new();
    for (path, hash, size) in entries {
        hasher.update(path.as_bytes());
        hasher.update(b"\0");
        hasher.update(hash.as_bytes());
        hasher.update(b"\0");
        hasher.update(size.to_le_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// Where the snapshot lives; recorded in the version pointer.
    pub storage_ref: String,
    pub bytes_transferred: u64,
    pub files_transferred: usize,
    pub content_hash: String,
    /// The snapshot was already stored; nothing was re-sent.
    pub reused: bool,
}

/// A file received into staging and verified against its hash.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub path: String,
    pub staged: PathBuf,
    pub hash: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct ReceivedSet {
    pub profile: String,
    pub storage_ref: String,
    pub content_hash: String,
    pub files: Vec<ReceivedFile>,
}

/// Signed authorization handed to the backend alongside a transfer.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub vault_id: Uuid,
    pub key_fingerprint: String,
    pub credentials: Credentials,
}

pub trait StorageBackend: Send + Sync {
    fn push(&self, set: &TransferSet, auth: &AuthContext) -> Result<TransferReport>;

    fn pull(
        &self,
        profile: &str,
        storage_ref: &str,
        staging: &Path,
        auth: &AuthContext,
    ) -> Result<ReceivedSet>;

    /// Whether the storage is reachable.
    fn test(&self) -> bool;

    fn info(&self) -> String;
}

/// Build the configured backend.
pub fn backend_from_config(provider: &ProviderConfig) -> Result<Arc<dyn StorageBackend>> {
    match provider {
        ProviderConfig::Unconfigured => Err(VaultSyncError::Configuration(
            "no storage provider configured; set [provider] in .local/config.toml".to_string(),
        )),
        ProviderConfig::Filesystem { path } => Ok(Arc::new(FilesystemBackend::new(path))),
    }
}

/// Manifest stored next to each snapshot's files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub vault_id: Uuid,
    pub profile: String,
    pub snapshot_id: Uuid,
    pub content_hash: String,
    pub files: Vec<ManifestFile>,
    pub pushed_at: i64,
    pub key_fingerprint: String,
    /// Push signature timestamp and value, kept as provenance.
    pub signed_at: Option<i64>,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub hash: String,
    pub size: u64,
}

/// Snapshots in a directory tree (local disk or a mounted remote filesystem).
///
/// ```text
/// <root>/<profile>/snapshots/<content_hash>/SNAPSHOT.json
/// <root>/<profile>/snapshots/<content_hash>/files/...
/// <root>/<profile>/.incoming/<uuid>/          in-flight pushes
/// ```
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn profile_dir(&self, profile: &str) -> PathBuf {
        self.root.join(profile)
    }

    fn storage_ref(profile: &str, content_hash: &str) -> String {
        format!("{}/snapshots/{}", profile, content_hash)
    }

    /// Split a storage ref into its content hash, checking it belongs to `profile`.
    fn parse_ref<'a>(profile: &str, storage_ref: &'a str) -> Result<&'a str> {
        let mismatch = || TransferError::ProfileMismatch(storage_ref.to_string());
        let rest = storage_ref
            .strip_prefix(profile)
            .and_then(|r| r.strip_prefix("/snapshots/"))
            .ok_or_else(mismatch)?;
        if rest.len() != 64 || !rest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(mismatch().into());
        }
        Ok(rest)
    }

    /// Remove in-flight directories left by an interrupted push.
    fn cleanup_incoming(&self, profile: &str) {
        let incoming = self.profile_dir(profile).join(INCOMING_DIR);
        if let Ok(entries) = fs::read_dir(&incoming) {
            for entry in entries.flatten() {
                warn!(path = %entry.path().display(), "Removing interrupted transfer");
                if let Err(e) = fs::remove_dir_all(entry.path()) {
                    warn!(path = %entry.path().display(), error = %e, "Could not remove interrupted transfer");
                }
            }
        }
    }
}

impl StorageBackend for FilesystemBackend {
    fn push(&self, set: &TransferSet, auth: &AuthContext) -> Result<TransferReport> {
        let content_hash = set.content_hash();
        let storage_ref = Self::storage_ref(&set.profile, &content_hash);
        let snapshots = self.profile_dir(&set.profile).join("snapshots");
        let final_dir = snapshots.join(&content_hash);

        if final_dir.join(MANIFEST_FILE).is_file() {
            debug!(%storage_ref, "Snapshot already stored");
            return Ok(TransferReport {
                storage_ref,
                bytes_transferred: 0,
                files_transferred: 0,
                content_hash,
                reused: true,
            });
        }

        self.cleanup_incoming(&set.profile);
        let staging = self
            .profile_dir(&set.profile)
            .join(INCOMING_DIR)
            .join(Uuid::new_v4().to_string());
        let files_root = staging.join(FILES_DIR);
        fs::create_dir_all(&files_root).map_err(backend_err)?;

        let result = (|| -> Result<u64> {
            let mut bytes = 0u64;
            for file in &set.files {
                let dest = join_relative(&files_root, &file.path);
                let (hash, size) = copy_hashed(&file.source, &dest).map_err(backend_err)?;
                if hash != file.hash {
                    return Err(TransferError::Integrity {
                        expected: file.hash.clone(),
                        actual: hash,
                    }
                    .into());
                }
                bytes += size;
            }

            let (signed_at, signature) = match &auth.credentials {
                Credentials::Signed(signed) => (Some(signed.timestamp), Some(signed.signature.clone())),
                Credentials::Session(_) => (None, None),
            };
            let manifest = SnapshotManifest {
                vault_id: auth.vault_id,
                profile: set.profile.clone(),
                snapshot_id: set.snapshot_id,
                content_hash: content_hash.clone(),
                files: set
                    .files
                    .iter()
                    .map(|f| ManifestFile {
                        path: f.path.clone(),
                        hash: f.hash.clone(),
                        size: f.size,
                    })
                    .collect(),
                pushed_at: chrono::Utc::now().timestamp(),
                key_fingerprint: auth.key_fingerprint.clone(),
                signed_at,
                signature,
            };
            let json = serde_json::to_vec_pretty(&manifest)?;
            let mut out = File::create(staging.join(MANIFEST_FILE)).map_err(backend_err)?;
            out.write_all(&json).map_err(backend_err)?;
            out.sync_all().map_err(backend_err)?;

            fs::create_dir_all(&snapshots).map_err(backend_err)?;
            fs::rename(&staging, &final_dir).map_err(backend_err)?;
            Ok(bytes)
        })();

        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&staging) {
                    warn!(path = %staging.display(), error = %cleanup, "Could not remove failed transfer");
                }
                if final_dir.join(MANIFEST_FILE).is_file() {
                    // Another push of the same content won the rename.
                    return Ok(TransferReport {
                        storage_ref,
                        bytes_transferred: 0,
                        files_transferred: 0,
                        content_hash,
                        reused: true,
                    });
                }
                return Err(e);
            }
        };

        info!(%storage_ref, bytes, files = set.files.len(), "Stored snapshot");
        Ok(TransferReport {
            storage_ref,
            bytes_transferred: bytes,
            files_transferred: set.files.len(),
            content_hash,
            reused: false,
        })
    }

    fn pull(
        &self,
        profile: &str,
        storage_ref: &str,
        staging: &Path,
        _auth: &AuthContext,
    ) -> Result<ReceivedSet> {
        let expected_hash = Self::parse_ref(profile, storage_ref)?;
        let snapshot_dir = self.profile_dir(profile).join("snapshots").join(expected_hash);

        let json = fs::read(snapshot_dir.join(MANIFEST_FILE)).map_err(backend_err)?;
        let manifest: SnapshotManifest = serde_json::from_slice(&json)
            .map_err(|e| TransferError::Backend(format!("corrupt snapshot manifest: {}", e)))?;
        if manifest.profile != profile {
            return Err(TransferError::ProfileMismatch(storage_ref.to_string()).into());
        }

        let mut listed = Vec::with_capacity(manifest.files.len());
        for file in &manifest.files {
            let normalized = validate_path(&file.path)?;
            if normalized != file.path {
                return Err(TransferError::Backend(format!(
                    "non-canonical path in manifest: {}",
                    file.path
                ))
                .into());
            }
            listed.push((file.path.as_str(), file.hash.as_str(), file.size));
        }
        let actual_hash = content_hash_of(listed.into_iter());
        if actual_hash != expected_hash || manifest.content_hash != expected_hash {
            return Err(TransferError::Integrity {
                expected: expected_hash.to_string(),
                actual: actual_hash,
            }
            .into());
        }

        fs::create_dir_all(staging).map_err(backend_err)?;
        let mut files = Vec::with_capacity(manifest.files.len());
        for file in &manifest.files {
            let source = join_relative(&snapshot_dir.join(FILES_DIR), &file.path);
            let dest = join_relative(staging, &file.path);
            let (hash, size) = copy_hashed(&source, &dest).map_err(backend_err)?;
            if hash != file.hash || size != file.size {
                return Err(TransferError::Integrity {
                    expected: file.hash.clone(),
                    actual: hash,
                }
                .into());
            }
            files.push(ReceivedFile {
                path: file.path.clone(),
                staged: dest,
                hash,
                size,
            });
        }

        debug!(%storage_ref, files = files.len(), "Retrieved snapshot");
        Ok(ReceivedSet {
            profile: profile.to_string(),
            storage_ref: storage_ref.to_string(),
            content_hash: manifest.content_hash,
            files,
        })
    }

    fn test(&self) -> bool {
        self.root.is_dir()
    }

    fn info(&self) -> String {
        format!("filesystem:{}", self.root.display())
    }
}

fn backend_err(err: std::io::Error) -> VaultSyncError {
    TransferError::Backend(err.to_string()).into()
}

fn join_relative(base: &Path, relative: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    for part in relative.split('/') {
        path.push(part);
    }
    path
}

/// Copy `source` to `dest`, returning the SHA-256 and size of the bytes written.
fn copy_hashed(source: &Path, dest: &Path) -> std::io::Result<(String, u64)> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut input = File::open(source)?;
    let mut output = File::create(dest)?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        output.write_all(&buf[..n])?;
        size += n as u64;
    }
    output.sync_all()?;
    Ok((hex::encode(hasher.finalize()), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::sha256_hex;
    use crate::sync::auth::SignedRequest;

    fn auth() -> AuthContext {
        AuthContext {
            vault_id: Uuid::new_v4(),
            key_fingerprint: "SHA256:test".to_string(),
            credentials: Credentials::Signed(SignedRequest {
                timestamp: 1,
                signature: "c2ln".to_string(),
            }),
        }
    }

    fn transfer_set(dir: &Path, profile: &str, files: &[(&str, &[u8])]) -> TransferSet {
        let objects = dir.join("objects");
        fs::create_dir_all(&objects).unwrap();
        let mut list: Vec<TransferFile> = files
            .iter()
            .map(|(path, data)| {
                let hash = sha256_hex(data);
                let source = objects.join(&hash);
                fs::write(&source, data).unwrap();
                TransferFile {
                    path: path.to_string(),
                    source,
                    hash,
                    size: data.len() as u64,
                }
            })
            .collect();
        list.sort_by(|a, b| a.path.cmp(&b.path));
        TransferSet {
            profile: profile.to_string(),
            snapshot_id: Uuid::new_v4(),
            files: list,
            excluded: Vec::new(),
        }
    }

    #[test]
    fn push_then_pull_verifies_content() {
        let dir = tempfile::tempdir().unwrap();
        let remote = dir.path().join("remote");
        fs::create_dir_all(&remote).unwrap();
        let backend = FilesystemBackend::new(&remote);
        assert!(backend.test());

        let set = transfer_set(dir.path(), "laptop", &[("a.txt", b"alpha"), ("d/b.txt", b"beta")]);
        let report = backend.push(&set, &auth()).unwrap();
        assert_eq!(report.content_hash, set.content_hash());
        assert_eq!(report.bytes_transferred, 9);
        assert!(!report.reused);

        let staging = dir.path().join("staging");
        let received = backend
            .pull("laptop", &report.storage_ref, &staging, &auth())
            .unwrap();
        assert_eq!(received.content_hash, report.content_hash);
        assert_eq!(received.files.len(), 2);
        assert_eq!(fs::read(staging.join("d/b.txt")).unwrap(), b"beta");
    }

    #[test]
    fn interrupted_transfer_is_cleared_by_next_push() {
        let dir = tempfile::tempdir().unwrap();
        let remote = dir.path().join("remote");
        let leftover = remote.join("laptop").join(INCOMING_DIR).join(Uuid::new_v4().to_string());
        fs::create_dir_all(leftover.join(FILES_DIR)).unwrap();
        fs::write(leftover.join(FILES_DIR).join("half.txt"), b"hal").unwrap();

        let backend = FilesystemBackend::new(&remote);
        let set = transfer_set(dir.path(), "laptop", &[("a.txt", b"alpha")]);
        backend.push(&set, &auth()).unwrap();

        assert!(!leftover.exists());
        let incoming = remote.join("laptop").join(INCOMING_DIR);
        assert_eq!(fs::read_dir(incoming).unwrap().count(), 0);
    }

    #[test]
    fn second_push_of_same_content_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path().join("remote"));
        let set = transfer_set(dir.path(), "laptop", &[("a.txt", b"alpha")]);
        let first = backend.push(&set, &auth()).unwrap();
        let second = backend.push(&set, &auth()).unwrap();
        assert_eq!(first.storage_ref, second.storage_ref);
        assert!(second.reused);
    }

    #[test]
    fn pull_refuses_other_profiles_refs() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path().join("remote"));
        let set = transfer_set(dir.path(), "alice-laptop", &[("a.txt", b"alpha")]);
        let report = backend.push(&set, &auth()).unwrap();

        let err = backend
            .pull("alice-desktop", &report.storage_ref, &dir.path().join("s"), &auth())
            .unwrap_err();
        assert!(matches!(
            err,
            VaultSyncError::Transfer(TransferError::ProfileMismatch(_))
        ));
    }

    #[test]
    fn tampered_remote_file_fails_pull() {
        let dir = tempfile::tempdir().unwrap();
        let remote = dir.path().join("remote");
        let backend = FilesystemBackend::new(&remote);
        let set = transfer_set(dir.path(), "laptop", &[("a.txt", b"alpha")]);
        let report = backend.push(&set, &auth()).unwrap();

        let stored = remote
            .join(&report.storage_ref)
            .join(FILES_DIR)
            .join("a.txt");
        fs::write(stored, b"evil!").unwrap();

        let err = backend
            .pull("laptop", &report.storage_ref, &dir.path().join("s"), &auth())
            .unwrap_err();
        assert!(matches!(
            err,
            VaultSyncError::Transfer(TransferError::Integrity { .. })
        ));
    }

    #[test]
    fn content_hash_depends_on_paths_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let a = transfer_set(dir.path(), "p", &[("a.txt", b"x")]);
        let b = transfer_set(dir.path(), "p", &[("b.txt", b"x")]);
        let c = transfer_set(dir.path(), "p", &[("a.txt", b"y")]);
        assert_ne!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
        assert_eq!(
            a.content_hash(),
            transfer_set(dir.path(), "p", &[("a.txt", b"x")]).content_hash()
        );
    }

    #[test]
    fn unconfigured_provider_is_configuration_error() {
        assert!(matches!(
            backend_from_config(&ProviderConfig::Unconfigured),
            Err(VaultSyncError::Configuration(_))
        ));
    }
}
