//! Sync coordinator: orchestrates the push and pull cycles.
//!
//! Push: commit, fetch exclusions, build the transfer set from head, sign,
//! transfer, record the version. Pull: look up the latest version, sign,
//! receive into staging, verify, plan overwrites, apply, commit.
//!
//! At most one cycle runs per vault at a time, enforced by the sync lock.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::VaultConfig;
use crate::history::{ChangeTracker, CommitOrigin, CommitOutcome, RollbackOutcome};
use crate::layout::{PathMatcher, VaultLayout};
use crate::sync::auth::Operation;
use crate::sync::backend::{
    AuthContext, ReceivedFile, StorageBackend, TransferFile, TransferReport, TransferSet,
};
use crate::sync::client::VaultClient;
use crate::sync::conflict::OverwritePlan;
use crate::sync::lock::FileLock;
use crate::sync::models::{NewVersion, VaultVersion};
use crate::sync::rules::fetch_exclusions_best_effort;
use crate::sync::state::SyncState;
use crate::{Result, TransferError, ValidationError, VaultSyncError};

/// Where the coordinator currently is. `Failed` persists until the next cycle starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Staging,
    Authenticating,
    Transferring,
    Reconciling,
    Failed,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Staging => "staging",
            Self::Authenticating => "authenticating",
            Self::Transferring => "transferring",
            Self::Reconciling => "reconciling",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct PushOutcome {
    pub commit: CommitOutcome,
    pub version: VaultVersion,
    pub report: TransferReport,
    pub files: usize,
    /// Paths held back by the profile's exclusion rules.
    pub excluded: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PullOptions {
    /// Overwrite local files that have uncommitted changes instead of stopping.
    pub overwrite_uncommitted: bool,
}

#[derive(Debug, Clone)]
pub enum PullOutcome {
    /// The profile has no recorded version yet.
    NothingToPull,
    /// Uncommitted local edits would be overwritten. Nothing was changed.
    Conflicts {
        version: VaultVersion,
        paths: Vec<String>,
    },
    Applied {
        version: VaultVersion,
        overwritten: Vec<String>,
        unchanged: usize,
        kept_local: usize,
        commit: CommitOutcome,
    },
}

pub struct SyncCoordinator {
    config: VaultConfig,
    layout: VaultLayout,
    tracker: ChangeTracker,
    client: VaultClient,
    backend: Arc<dyn StorageBackend>,
    phase: Mutex<SyncPhase>,
}

impl SyncCoordinator {
    pub fn new(
        config: VaultConfig,
        layout: VaultLayout,
        tracker: ChangeTracker,
        client: VaultClient,
        backend: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            config,
            layout,
            tracker,
            client,
            backend,
            phase: Mutex::new(SyncPhase::Idle),
        }
    }

    /// Wire up the production stack from a vault's config: on-disk key,
    /// HTTP relay client and the configured storage backend.
    #[cfg(feature = "http")]
    pub fn from_config(layout: &VaultLayout, config: VaultConfig) -> Result<Self> {
        use crate::sync::backend::backend_from_config;
        use crate::sync::keys::KeyManager;
        use crate::sync::transport::HttpTransport;

        let keys = KeyManager::for_vault(layout, config.hostname.clone());
        if !keys.exists() {
            return Err(VaultSyncError::Key(
                "no vault key on this machine; run `vaultsync init` first".to_string(),
            ));
        }
        let transport = HttpTransport::new(
            config.relay_url()?,
            Duration::from_secs(config.request_timeout_secs),
        )?;
        let client = VaultClient::new(Arc::new(transport), Arc::new(keys), config.vault_id);
        let backend = backend_from_config(&config.provider)?;
        let tracker = ChangeTracker::open(layout, &config.local_only, &config.hostname)?;
        Ok(Self::new(config, layout.clone(), tracker, client, backend))
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn client(&self) -> &VaultClient {
        &self.client
    }

    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase.lock().map(|p| *p).unwrap_or(SyncPhase::Failed)
    }

    fn set_phase(&self, phase: SyncPhase) {
        if let Ok(mut current) = self.phase.lock() {
            let previous = *current;
            debug!(from = %previous, to = %phase, "Sync phase");
            *current = phase;
        }
    }

    fn finish<T>(&self, result: &Result<T>) {
        match result {
            Ok(_) => self.set_phase(SyncPhase::Idle),
            Err(e) => {
                warn!(error = %e, retryable = e.is_retryable(), "Sync cycle failed");
                self.set_phase(SyncPhase::Failed);
            }
        }
    }

    /// Commit local changes under the sync lock.
    pub fn commit_local(&self) -> Result<CommitOutcome> {
        let _lock = FileLock::acquire_sync(&self.layout.sync_lock_path())?;
        self.tracker.commit()
    }

    /// Restore the previous commit. Refused with `AlreadySyncing` while a
    /// push, pull or commit is running.
    pub fn rollback(&self, confirmed: bool) -> Result<RollbackOutcome> {
        self.tracker.rollback(confirmed)
    }

    /// Commit and push this machine's tree to its own profile.
    pub async fn push(&self) -> Result<PushOutcome> {
        let _lock = FileLock::acquire_sync(&self.layout.sync_lock_path())?;
        let result = self.push_locked().await;
        self.finish(&result);
        result
    }

    async fn push_locked(&self) -> Result<PushOutcome> {
        let profile = self.config.profile.clone();

        self.set_phase(SyncPhase::Staging);
        let commit = self.tracker.commit()?;
        let head = self
            .tracker
            .head_snapshot()?
            .ok_or_else(|| VaultSyncError::History("nothing committed yet".to_string()))?;

        let exclusions = fetch_exclusions_best_effort(&self.client, &profile).await;
        let excluded_matcher = PathMatcher::new(&exclusions);
        let mut files = Vec::with_capacity(head.entries.len());
        let mut excluded = Vec::new();
        for (path, entry) in &head.entries {
            if self.tracker.machine_local().contains(path) {
                continue;
            }
            if excluded_matcher.matches(path) {
                excluded.push(path.clone());
                continue;
            }
            files.push(TransferFile {
                path: path.clone(),
                source: self.tracker.store().object_path(&entry.hash)?,
                hash: entry.hash.clone(),
                size: entry.size,
            });
        }
        let set = TransferSet {
            profile: profile.clone(),
            snapshot_id: head.id,
            files,
            excluded,
        };
        let content_hash = set.content_hash();

        self.set_phase(SyncPhase::Authenticating);
        let auth = self.auth_context(Operation::Push, &[profile.as_str(), content_hash.as_str()])?;

        self.set_phase(SyncPhase::Transferring);
        let backend = Arc::clone(&self.backend);
        let transfer_set = set.clone();
        let report = self
            .run_transfer(move || backend.push(&transfer_set, &auth))
            .await?;
        if report.content_hash != content_hash {
            return Err(TransferError::Integrity {
                expected: content_hash,
                actual: report.content_hash,
            }
            .into());
        }

        self.set_phase(SyncPhase::Reconciling);
        let version = self
            .client
            .record_version(
                &profile,
                &NewVersion {
                    storage_ref: report.storage_ref.clone(),
                    size_bytes: set.total_bytes(),
                    content_hash: content_hash.clone(),
                },
            )
            .await?;

        let mut state = SyncState::load(&self.layout)?;
        state.last_push_at = Some(chrono::Utc::now().timestamp());
        state.last_pushed_hash = Some(content_hash);
        state.last_pushed_version = Some(version.version_id);
        state.save(&self.layout)?;

        info!(
            %profile,
            version = %version.version_id,
            files = set.files.len(),
            excluded = set.excluded.len(),
            bytes = report.bytes_transferred,
            reused = report.reused,
            "Pushed vault"
        );
        Ok(PushOutcome {
            commit,
            version,
            report,
            files: set.files.len(),
            excluded: set.excluded,
        })
    }

    /// Pull the latest version of this machine's own profile.
    pub async fn pull(&self, options: PullOptions) -> Result<PullOutcome> {
        let profile = self.config.profile.clone();
        self.pull_from(&profile, options).await
    }

    /// Restore another machine's profile into this tree.
    pub async fn restore_profile(&self, profile: &str, options: PullOptions) -> Result<PullOutcome> {
        crate::config::validate_profile_name(profile)?;
        if profile != self.config.profile {
            info!(from = %profile, into = %self.config.profile, "Restoring from another profile");
        }
        self.pull_from(profile, options).await
    }

    async fn pull_from(&self, profile: &str, options: PullOptions) -> Result<PullOutcome> {
        let _lock = FileLock::acquire_sync(&self.layout.sync_lock_path())?;
        let result = self.pull_locked(profile, options).await;
        self.finish(&result);
        result
    }

    async fn pull_locked(&self, profile: &str, options: PullOptions) -> Result<PullOutcome> {
        self.set_phase(SyncPhase::Authenticating);
        let Some(version) = self.client.latest_version(profile).await? else {
            info!(%profile, "No versions recorded, nothing to pull");
            return Ok(PullOutcome::NothingToPull);
        };
        if version.profile != profile {
            return Err(TransferError::ProfileMismatch(version.storage_ref).into());
        }
        let auth = self.auth_context(Operation::Pull, &[profile, version.storage_ref.as_str()])?;

        self.set_phase(SyncPhase::Transferring);
        let staging = StagingDir::create(&self.layout.staging_dir())?;
        let backend = Arc::clone(&self.backend);
        let (owned_profile, storage_ref, staging_path) = (
            profile.to_string(),
            version.storage_ref.clone(),
            staging.path().to_path_buf(),
        );
        let received = self
            .run_transfer(move || backend.pull(&owned_profile, &storage_ref, &staging_path, &auth))
            .await?;
        if received.content_hash != version.content_hash {
            return Err(TransferError::Integrity {
                expected: version.content_hash.clone(),
                actual: received.content_hash,
            }
            .into());
        }

        self.set_phase(SyncPhase::Reconciling);
        let scan = self.tracker.scan()?;
        let mut plan = OverwritePlan::build(&received, &scan, self.tracker.machine_local());
        if plan.has_conflicts() {
            if !options.overwrite_uncommitted {
                warn!(%profile, conflicts = plan.conflicts.len(), "Pull would overwrite uncommitted changes");
                return Ok(PullOutcome::Conflicts {
                    version,
                    paths: plan.conflicts,
                });
            }
            warn!(%profile, conflicts = plan.conflicts.len(), "Overwriting uncommitted changes");
            plan = plan.force();
        }

        let overwrite: HashSet<&str> = plan.overwrite.iter().map(String::as_str).collect();
        let incoming: Vec<&ReceivedFile> = received
            .files
            .iter()
            .filter(|f| overwrite.contains(f.path.as_str()))
            .collect();
        check_tree_collisions(&self.layout, &incoming)?;
        let parked = StagingDir::create(&self.layout.staging_dir())?;
        apply_overwrites(&self.layout, &incoming, parked.path())?;
        drop(parked);
        drop(staging);

        let commit = self.tracker.commit_as(CommitOrigin::Pull {
            profile: profile.to_string(),
        })?;

        let mut state = SyncState::load(&self.layout)?;
        state.last_pull_at = Some(chrono::Utc::now().timestamp());
        state.last_pulled_profile = Some(profile.to_string());
        state.last_pulled_version = Some(version.version_id);
        state.save(&self.layout)?;

        info!(
            %profile,
            version = %version.version_id,
            overwritten = plan.overwrite.len(),
            unchanged = plan.unchanged.len(),
            "Pulled vault"
        );
        Ok(PullOutcome::Applied {
            version,
            overwritten: plan.overwrite,
            unchanged: plan.unchanged.len(),
            kept_local: plan.kept_local.len(),
            commit,
        })
    }

    fn auth_context(&self, op: Operation, scope: &[&str]) -> Result<AuthContext> {
        Ok(AuthContext {
            vault_id: self.config.vault_id,
            key_fingerprint: self.client.signer().fingerprint()?,
            credentials: self.client.sign(op, scope)?,
        })
    }

    /// Run a blocking backend call on the blocking pool, bounded by the transfer timeout.
    async fn run_transfer<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let secs = self.config.transfer_timeout_secs;
        match tokio::time::timeout(Duration::from_secs(secs), tokio::task::spawn_blocking(f)).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(TransferError::Backend(format!("transfer task failed: {}", join)).into()),
            Err(_) => Err(TransferError::Timeout(secs).into()),
        }
    }
}

/// Refuse a pull whose files would land on a local directory or under a
/// local regular file. Runs before anything in the tree is touched.
fn check_tree_collisions(layout: &VaultLayout, files: &[&ReceivedFile]) -> Result<()> {
    let collision = |path: &str, reason: String| -> VaultSyncError {
        ValidationError::InvalidPath {
            path: path.to_string(),
            reason,
        }
        .into()
    };
    for file in files {
        let dest = layout.resolve(&file.path);
        if fs::symlink_metadata(&dest).is_ok_and(|m| m.is_dir()) {
            return Err(collision(&file.path, "a local directory is in the way".to_string()));
        }
        let mut parent = dest.parent();
        while let Some(dir) = parent {
            if dir == layout.root() {
                break;
            }
            if fs::symlink_metadata(dir).is_ok_and(|m| !m.is_dir()) {
                let blocker = dir.strip_prefix(layout.root()).unwrap_or(dir);
                return Err(collision(
                    &file.path,
                    format!("local file {} is in the way", blocker.display()),
                ));
            }
            parent = dir.parent();
        }
    }
    Ok(())
}

/// One file moved into the tree, with the local file it replaced.
struct AppliedFile {
    dest: PathBuf,
    parked: Option<PathBuf>,
}

/// Move staged files into the tree. Replaced files are parked under
/// `parked_dir`; if any move fails every applied file is undone before the
/// error is returned.
fn apply_overwrites(layout: &VaultLayout, files: &[&ReceivedFile], parked_dir: &Path) -> Result<()> {
    let mut applied = Vec::with_capacity(files.len());
    for (index, file) in files.iter().enumerate() {
        match apply_one(layout, file, &parked_dir.join(index.to_string())) {
            Ok(done) => applied.push(done),
            Err(e) => {
                warn!(path = %file.path, error = %e, undo = applied.len(), "Pull apply failed, restoring tree");
                undo_overwrites(applied);
                return Err(e.into());
            }
        }
    }
    Ok(())
}

fn apply_one(layout: &VaultLayout, file: &ReceivedFile, park_at: &Path) -> std::io::Result<AppliedFile> {
    let dest = layout.resolve(&file.path);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let parked = match fs::symlink_metadata(&dest) {
        Ok(_) => {
            fs::rename(&dest, park_at)?;
            Some(park_at.to_path_buf())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };
    if let Err(e) = fs::rename(&file.staged, &dest) {
        undo_overwrites(vec![AppliedFile { dest, parked }]);
        return Err(e);
    }
    Ok(AppliedFile { dest, parked })
}

fn undo_overwrites(applied: Vec<AppliedFile>) {
    for AppliedFile { dest, parked } in applied.into_iter().rev() {
        let result = match &parked {
            Some(original) => fs::rename(original, &dest),
            None => match fs::remove_file(&dest) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        if let Err(e) = result {
            warn!(path = %dest.display(), error = %e, "Could not restore file after failed pull");
        }
    }
}

/// Per-pull staging directory, removed on drop whatever the outcome.
struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    fn create(base: &Path) -> Result<Self> {
        let path = base.join(Uuid::new_v4().to_string());
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Could not remove staging directory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(dir: &Path, path: &str, data: Option<&[u8]>) -> ReceivedFile {
        let staged = dir.join(path.replace('/', "_"));
        if let Some(data) = data {
            fs::write(&staged, data).unwrap();
        }
        ReceivedFile {
            path: path.to_string(),
            staged,
            hash: String::new(),
            size: 0,
        }
    }

    #[test]
    fn failed_apply_restores_replaced_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = VaultLayout::new(dir.path().join("vault"));
        let incoming = dir.path().join("incoming");
        let parked = dir.path().join("parked");
        fs::create_dir_all(layout.root()).unwrap();
        fs::create_dir_all(&incoming).unwrap();
        fs::create_dir_all(&parked).unwrap();
        fs::write(layout.resolve("a.txt"), b"local a").unwrap();

        let files = [
            staged(&incoming, "a.txt", Some(b"remote a")),
            staged(&incoming, "new/b.txt", Some(b"remote b")),
            // Never staged, so the third move fails.
            staged(&incoming, "c.txt", None),
        ];
        let refs: Vec<&ReceivedFile> = files.iter().collect();

        assert!(apply_overwrites(&layout, &refs, &parked).is_err());
        assert_eq!(fs::read(layout.resolve("a.txt")).unwrap(), b"local a");
        assert!(!layout.resolve("new/b.txt").exists());
        assert!(!layout.resolve("c.txt").exists());
    }

    #[test]
    fn collisions_with_local_files_and_directories_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let layout = VaultLayout::new(dir.path());
        fs::write(layout.resolve("b"), b"a plain file").unwrap();
        fs::create_dir_all(layout.resolve("notes")).unwrap();

        let under_file = staged(dir.path(), "b/c.txt", None);
        assert!(matches!(
            check_tree_collisions(&layout, &[&under_file]),
            Err(VaultSyncError::Validation(ValidationError::InvalidPath { .. }))
        ));

        let onto_dir = staged(dir.path(), "notes", None);
        assert!(check_tree_collisions(&layout, &[&onto_dir]).is_err());

        let fine = staged(dir.path(), "notes/today.md", None);
        assert!(check_tree_collisions(&layout, &[&fine]).is_ok());
    }
}
