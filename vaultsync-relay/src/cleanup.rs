//! Background cleanup: prune expired session tokens.

use crate::storage::RelayStorage;
use std::time::Duration;
use tokio::time;

pub fn spawn_cleanup_task(storage: RelayStorage, interval_secs: u64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            interval.tick().await;
            match run_cleanup(&storage, chrono::Utc::now().timestamp()) {
                Ok(0) => tracing::debug!("Cleanup completed"),
                Ok(removed) => tracing::info!(removed, "Pruned expired sessions"),
                Err(e) => tracing::error!("Cleanup error: {}", e),
            }
        }
    })
}

fn run_cleanup(storage: &RelayStorage, now: i64) -> Result<usize, crate::error::RelayError> {
    storage.delete_expired_sessions(now)
}
