//! Background watcher: commits the vault tree after it goes quiet.
//!
//! Filesystem events from `notify` feed a debouncer; once no event has
//! arrived for the quiescence window the watcher commits (and pushes, when
//! `auto_push` is set). Liveness is published through a heartbeat file so
//! `status` can tell a running watcher from a dead one.

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::history::CommitOutcome;
use crate::layout::VaultLayout;
use crate::sync::engine::SyncCoordinator;
use crate::sync::lock::FileLock;
use crate::{platform, Result, VaultSyncError};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A heartbeat older than this means the watcher died without cleaning up.
pub const STALE_AFTER_SECS: i64 = 15;

const TICK: Duration = Duration::from_millis(250);

/// Contents of `.local/watcher.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherHeartbeat {
    pub pid: u32,
    pub started_at: i64,
    pub last_beat_at: i64,
    pub last_commit_at: Option<i64>,
    pub commits: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherActivity {
    Stopped,
    Running {
        pid: u32,
        started_at: i64,
        last_commit_at: Option<i64>,
    },
    /// Heartbeat file left behind by a watcher that stopped beating.
    Stale { pid: u32, last_beat_at: i64 },
}

impl WatcherActivity {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn from_heartbeat(heartbeat: Option<&WatcherHeartbeat>, now: i64) -> Self {
        match heartbeat {
            None => Self::Stopped,
            Some(hb) if now - hb.last_beat_at > STALE_AFTER_SECS => Self::Stale {
                pid: hb.pid,
                last_beat_at: hb.last_beat_at,
            },
            Some(hb) => Self::Running {
                pid: hb.pid,
                started_at: hb.started_at,
                last_commit_at: hb.last_commit_at,
            },
        }
    }
}

impl std::fmt::Display for WatcherActivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running { pid, .. } => write!(f, "running (pid {})", pid),
            Self::Stale { pid, .. } => write!(f, "not responding (pid {})", pid),
        }
    }
}

pub fn read_heartbeat(layout: &VaultLayout) -> Option<WatcherHeartbeat> {
    let json = std::fs::read(layout.heartbeat_path()).ok()?;
    match serde_json::from_slice(&json) {
        Ok(hb) => Some(hb),
        Err(e) => {
            warn!(error = %e, "Ignoring unreadable watcher heartbeat");
            None
        }
    }
}

pub fn read_activity(layout: &VaultLayout) -> WatcherActivity {
    WatcherActivity::from_heartbeat(
        read_heartbeat(layout).as_ref(),
        chrono::Utc::now().timestamp(),
    )
}

/// Ask a running watcher to exit. It notices within one tick.
pub fn request_stop(layout: &VaultLayout) -> Result<()> {
    std::fs::create_dir_all(layout.local_dir())?;
    platform::write_atomic(
        &layout.stop_request_path(),
        chrono::Utc::now().timestamp().to_string().as_bytes(),
    )?;
    Ok(())
}

pub fn stop_requested(layout: &VaultLayout) -> bool {
    layout.stop_request_path().exists()
}

/// Quiescence tracker: ready once events stop arriving for `quiet`.
#[derive(Debug)]
pub struct Debouncer {
    quiet: Duration,
    last_event: Option<Instant>,
    events: usize,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            last_event: None,
            events: 0,
        }
    }

    pub fn record(&mut self, at: Instant) {
        self.last_event = Some(at);
        self.events += 1;
    }

    pub fn is_pending(&self) -> bool {
        self.last_event.is_some()
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.last_event
            .is_some_and(|last| now.saturating_duration_since(last) >= self.quiet)
    }

    /// Clear pending events, returning how many were coalesced.
    pub fn take(&mut self) -> usize {
        self.last_event = None;
        std::mem::take(&mut self.events)
    }
}

/// Whether a notify event can change tracked content.
fn is_content_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    )
}

pub struct VaultWatcher {
    coordinator: Arc<SyncCoordinator>,
    layout: VaultLayout,
    quiescence: Duration,
    auto_push: bool,
}

impl VaultWatcher {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        let config = coordinator.config();
        let quiescence = Duration::from_millis(config.quiescence_ms);
        let auto_push = config.auto_push;
        let layout = coordinator.tracker().layout().clone();
        Self {
            coordinator,
            layout,
            quiescence,
            auto_push,
        }
    }

    /// Watch until `shutdown` resolves or a stop is requested.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let _instance = FileLock::try_acquire(&self.layout.watcher_lock_path())?
            .ok_or(VaultSyncError::WatcherRunning)?;
        let _ = std::fs::remove_file(self.layout.stop_request_path());

        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => error!("File watcher error: {}", e),
            },
            Config::default(),
        )
        .map_err(notify_err)?;
        watcher
            .watch(self.layout.root(), RecursiveMode::Recursive)
            .map_err(notify_err)?;
        info!(root = %self.layout.root().display(), quiescence_ms = self.quiescence.as_millis() as u64, "Watching vault");

        let started_at = chrono::Utc::now().timestamp();
        let mut heartbeat = WatcherHeartbeat {
            pid: std::process::id(),
            started_at,
            last_beat_at: started_at,
            last_commit_at: None,
            commits: 0,
        };
        self.write_heartbeat(&heartbeat);

        // Commit whatever changed while no watcher was running.
        let mut debouncer = Debouncer::new(self.quiescence);
        debouncer.record(Instant::now());

        let mut tick = tokio::time::interval(TICK);
        let mut beat = tokio::time::interval(HEARTBEAT_INTERVAL);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
                Some(event) = rx.recv() => {
                    if self.is_relevant(&event) {
                        debouncer.record(Instant::now());
                    }
                }
                _ = tick.tick() => {
                    if stop_requested(&self.layout) {
                        info!("Stop requested");
                        break;
                    }
                    if debouncer.ready(Instant::now()) {
                        let coalesced = debouncer.take();
                        debug!(events = coalesced, "Tree quiet, committing");
                        if self.cycle(&mut heartbeat).await {
                            self.write_heartbeat(&heartbeat);
                        } else {
                            debouncer.record(Instant::now());
                        }
                    }
                }
                _ = beat.tick() => {
                    heartbeat.last_beat_at = chrono::Utc::now().timestamp();
                    self.write_heartbeat(&heartbeat);
                }
            }
        }

        if debouncer.is_pending() {
            self.cycle(&mut heartbeat).await;
        }
        drop(watcher);
        let _ = std::fs::remove_file(self.layout.heartbeat_path());
        let _ = std::fs::remove_file(self.layout.stop_request_path());
        info!(commits = heartbeat.commits, "Watcher stopped");
        Ok(())
    }

    fn is_relevant(&self, event: &Event) -> bool {
        if !is_content_event(event) {
            return false;
        }
        let machine_local = self.coordinator.tracker().machine_local();
        event.paths.iter().any(|path| match self.layout.relative(path) {
            Some(rel) => !machine_local.contains(&rel),
            None => false,
        })
    }

    /// One commit (or push) attempt. Returns false if it should be retried later.
    async fn cycle(&self, heartbeat: &mut WatcherHeartbeat) -> bool {
        let committed = if self.auto_push {
            match self.coordinator.push().await {
                Ok(outcome) => {
                    info!(version = %outcome.version.version_id, "Auto-pushed vault");
                    matches!(outcome.commit, CommitOutcome::Committed(_))
                }
                Err(e) => return self.handle_failure(e),
            }
        } else {
            match self.coordinator.commit_local() {
                Ok(outcome) => matches!(outcome, CommitOutcome::Committed(_)),
                Err(e) => return self.handle_failure(e),
            }
        };
        if committed {
            heartbeat.last_commit_at = Some(chrono::Utc::now().timestamp());
            heartbeat.commits += 1;
        }
        true
    }

    fn handle_failure(&self, err: VaultSyncError) -> bool {
        match err {
            VaultSyncError::AlreadySyncing => {
                debug!("Sync in progress, retrying later");
                false
            }
            e if e.is_retryable() => {
                warn!(error = %e, "Sync failed, retrying after next quiet period");
                false
            }
            e => {
                error!(error = %e, "Watcher cycle failed");
                true
            }
        }
    }

    fn write_heartbeat(&self, heartbeat: &WatcherHeartbeat) {
        let result = serde_json::to_vec(heartbeat)
            .map_err(VaultSyncError::from)
            .and_then(|json| Ok(platform::write_atomic(&self.layout.heartbeat_path(), &json)?));
        if let Err(e) = result {
            warn!(error = %e, "Could not write watcher heartbeat");
        }
    }
}

fn notify_err(err: notify::Error) -> VaultSyncError {
    VaultSyncError::Io(std::io::Error::other(err.to_string()))
}
