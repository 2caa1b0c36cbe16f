//! Scheduled removal of expired sessions.

use crate::codec::unix_now;
use crate::db::Database;
use std::time::Duration;
use tracing::{error, info};

/// Interval between cleanup runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60); // 1 hour

/// Run all cleanup tasks once.
pub async fn run_cleanup(db: &Database) {
    match db.sessions().delete_expired(unix_now()).await {
        Ok(count) if count > 0 => info!(count, "Cleaned up expired sessions"),
        Ok(_) => {}
        Err(e) => error!(error = %e, "Failed to clean up expired sessions"),
    }
}

/// Spawn a background task that runs cleanup periodically.
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_scheduler(db: Database) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);

        loop {
            interval.tick().await;
            run_cleanup(&db).await;
        }
    })
}
