//! Local change history for the vault tree.
//!
//! Every commit records a full snapshot (path -> content hash) so any commit
//! can be diffed against or rolled back to. Rollback moves the working tree
//! and the head pointer backward; history entries are never deleted.

pub mod snapshot;
pub mod store;

use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::layout::{MachineLocal, PathMatcher, VaultLayout};
use crate::sync::lock::FileLock;
use crate::sync::state::SyncState;
use crate::watcher::{self, WatcherActivity};
use crate::{platform, Result, VaultSyncError};

pub use snapshot::{Change, ChangeKind, CommitOrigin, CommitRecord, FileEntry, Snapshot, TreeScan};
pub use store::{hash_file, sha256_hex, HistoryStore};

/// Outcome of [`ChangeTracker::commit`]. An empty diff is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(CommitSummary),
    NothingToCommit,
}

/// One line of `log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    pub id: Uuid,
    pub created_at: i64,
    pub hostname: String,
    pub origin: CommitOrigin,
    pub changed_paths: usize,
    pub is_head: bool,
}

/// Result of [`ChangeTracker::rollback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub from: Uuid,
    pub to: Uuid,
    pub restored: usize,
    pub removed: usize,
}

#[derive(Debug, Clone)]
pub struct TrackerStatus {
    pub watcher: WatcherActivity,
    pub head: Option<Uuid>,
    pub last_commit_at: Option<i64>,
    pub last_push_at: Option<i64>,
    pub last_pull_at: Option<i64>,
    pub pending_changes: usize,
}

pub struct ChangeTracker {
    layout: VaultLayout,
    machine_local: MachineLocal,
    hostname: String,
    store: HistoryStore,
}

impl ChangeTracker {
    /// Open the history store of a vault. `local_only` paths are never tracked.
    pub fn open(layout: &VaultLayout, local_only: &[String], hostname: &str) -> Result<Self> {
        let store = HistoryStore::open(layout.history_dir())?;
        Ok(Self {
            layout: layout.clone(),
            machine_local: MachineLocal::new(PathMatcher::new(local_only)),
            hostname: hostname.to_string(),
            store,
        })
    }

    pub fn layout(&self) -> &VaultLayout {
        &self.layout
    }

    pub fn machine_local(&self) -> &MachineLocal {
        &self.machine_local
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    pub fn head(&self) -> Result<Option<Uuid>> {
        Ok(self.store.read_index()?.head)
    }

    pub fn head_snapshot(&self) -> Result<Option<Snapshot>> {
        match self.head()? {
            Some(id) => Ok(Some(self.store.read_snapshot(&id)?)),
            None => Ok(None),
        }
    }

    pub fn snapshot(&self, id: &Uuid) -> Result<Snapshot> {
        self.store.read_snapshot(id)
    }

    /// Compare the working tree to the head snapshot.
    pub fn scan(&self) -> Result<TreeScan> {
        let base = self
            .head_snapshot()?
            .map(|s| s.entries)
            .unwrap_or_default();
        snapshot::scan_tree(&self.layout, &self.machine_local, &base)
    }

    /// Added, modified and deleted paths since the last commit, sorted by path.
    pub fn diff(&self) -> Result<Vec<Change>> {
        Ok(self.scan()?.changes)
    }

    /// Record a snapshot if anything changed.
    pub fn commit(&self) -> Result<CommitOutcome> {
        self.commit_as(CommitOrigin::Local)
    }

    pub fn commit_as(&self, origin: CommitOrigin) -> Result<CommitOutcome> {
        self.commit_inner(origin, false)
    }

    /// Create the root commit of a fresh history. No-op if history already exists.
    pub fn init(&self) -> Result<CommitOutcome> {
        if self.head()?.is_some() {
            return Ok(CommitOutcome::NothingToCommit);
        }
        self.commit_inner(CommitOrigin::Init, true)
    }

    fn commit_inner(&self, origin: CommitOrigin, force: bool) -> Result<CommitOutcome> {
        let mut index = self.store.read_index()?;
        let base = match index.head {
            Some(id) => self.store.read_snapshot(&id)?.entries,
            None => BTreeMap::new(),
        };
        let scan = snapshot::scan_tree(&self.layout, &self.machine_local, &base)?;
        if scan.changes.is_empty() && !force {
            return Ok(CommitOutcome::NothingToCommit);
        }

        let mut entries = BTreeMap::new();
        for (path, file) in &scan.files {
            let unchanged = base.get(path).is_some_and(|prev| prev.hash == file.hash)
                && self.store.has_object(&file.hash);
            let (hash, size) = if unchanged {
                (file.hash.clone(), file.size)
            } else {
                self.store.store_file(&self.layout.resolve(path))?
            };
            entries.insert(
                path.clone(),
                FileEntry {
                    hash,
                    size,
                    modified_secs: file.modified_secs,
                    modified_nanos: file.modified_nanos,
                    mode: file.mode,
                },
            );
        }

        let snapshot = Snapshot {
            id: Uuid::new_v4(),
            parent: index.head,
            created_at: chrono::Utc::now().timestamp(),
            hostname: self.hostname.clone(),
            origin: origin.clone(),
            entries,
            changes: scan.changes,
        };
        self.store.write_snapshot(&snapshot)?;

        index.head = Some(snapshot.id);
        index.commits.push(CommitRecord {
            id: snapshot.id,
            parent: snapshot.parent,
            created_at: snapshot.created_at,
            hostname: snapshot.hostname.clone(),
            origin: origin.clone(),
            changed_paths: snapshot.changes.len(),
        });
        self.store.write_index(&index)?;

        info!(
            commit = %snapshot.id,
            changed = snapshot.changes.len(),
            %origin,
            "Committed vault snapshot"
        );

        Ok(CommitOutcome::Committed(CommitSummary {
            id: snapshot.id,
            created_at: snapshot.created_at,
            hostname: snapshot.hostname,
            origin,
            changed_paths: snapshot.changes.len(),
            is_head: true,
        }))
    }

    /// Restore the working tree to the snapshot before head.
    ///
    /// Destroys uncommitted changes, so it refuses to run unless `confirmed`.
    /// Takes the sync lock, failing with [`VaultSyncError::AlreadySyncing`]
    /// while a commit, push or pull holds it.
    pub fn rollback(&self, confirmed: bool) -> Result<RollbackOutcome> {
        let _lock = FileLock::acquire_sync(&self.layout.sync_lock_path())?;
        self.rollback_locked(confirmed)
    }

    fn rollback_locked(&self, confirmed: bool) -> Result<RollbackOutcome> {
        let mut index = self.store.read_index()?;
        let head_id = index
            .head
            .ok_or_else(|| VaultSyncError::History("no commits to roll back".to_string()))?;
        let head = self.store.read_snapshot(&head_id)?;
        let target_id = head.parent.ok_or_else(|| {
            VaultSyncError::History("head is the first commit; nothing earlier to restore".to_string())
        })?;
        let target = self.store.read_snapshot(&target_id)?;

        if let Some(missing) = target
            .entries
            .values()
            .find(|entry| !self.store.has_object(&entry.hash))
        {
            return Err(VaultSyncError::History(format!(
                "cannot roll back: object {} is missing",
                missing.hash
            )));
        }

        if !confirmed {
            let pending = self.diff()?.len();
            return Err(VaultSyncError::ConfirmationRequired(format!(
                "rollback to {} discards {} uncommitted change(s) and rewrites the working tree",
                target_id, pending
            )));
        }

        let scan = snapshot::scan_tree(&self.layout, &self.machine_local, &head.entries)?;
        let (restored, removed) = self.restore_tree(&target, &scan)?;

        index.head = Some(target_id);
        self.store.write_index(&index)?;

        warn!(from = %head_id, to = %target_id, restored, removed, "Rolled back working tree");
        Ok(RollbackOutcome {
            from: head_id,
            to: target_id,
            restored,
            removed,
        })
    }

    /// Make the working tree match `target`. Returns (restored, removed) counts.
    fn restore_tree(&self, target: &Snapshot, current: &TreeScan) -> Result<(usize, usize)> {
        let mut restored = 0;
        let mut removed = 0;

        for (path, entry) in &target.entries {
            let up_to_date = current
                .files
                .get(path)
                .is_some_and(|f| f.hash == entry.hash);
            if up_to_date {
                continue;
            }
            let dest = self.layout.resolve(path);
            self.store.restore_object(&entry.hash, &dest)?;
            if let Some(mode) = entry.mode {
                if let Err(e) = platform::set_mode(&dest, mode) {
                    warn!(%path, error = %e, "Could not restore file mode");
                }
            }
            restored += 1;
        }

        for path in current.files.keys() {
            if target.entries.contains_key(path) {
                continue;
            }
            let abs = self.layout.resolve(path);
            std::fs::remove_file(&abs)?;
            snapshot::prune_empty_dirs(&abs, self.layout.root());
            removed += 1;
        }

        Ok((restored, removed))
    }

    /// Commit summaries, newest first.
    pub fn log(&self, limit: Option<usize>) -> Result<Vec<CommitSummary>> {
        let index = self.store.read_index()?;
        Ok(index
            .commits
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .map(|record| CommitSummary {
                id: record.id,
                created_at: record.created_at,
                hostname: record.hostname.clone(),
                origin: record.origin.clone(),
                changed_paths: record.changed_paths,
                is_head: index.head == Some(record.id),
            })
            .collect())
    }

    pub fn status(&self) -> Result<TrackerStatus> {
        let index = self.store.read_index()?;
        let last_commit_at = index.commits.last().map(|c| c.created_at);
        let state = SyncState::load(&self.layout)?;
        Ok(TrackerStatus {
            watcher: watcher::read_activity(&self.layout),
            head: index.head,
            last_commit_at,
            last_push_at: state.last_push_at,
            last_pull_at: state.last_pull_at,
            pending_changes: self.diff()?.len(),
        })
    }
}
