//! Eviction sweep for expired sessions.
//!
//! Runs as a background task removing terminal sessions past the retention
//! window and `CREATED` sessions that outlived the staging timeout without
//! a channel ever attaching.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::SessionRegistry;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn the eviction sweep background task.
///
/// The task ticks once a minute until `cancel` fires. Eviction itself is
/// delegated to [`SessionRegistry::evict_expired`].
#[must_use]
pub fn spawn_eviction_task(
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        // The first tick fires immediately; skip it so a fresh server
        // does not sweep before anything could possibly expire.
        interval.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("eviction task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let evicted = registry.evict_expired().await;
                    if evicted > 0 {
                        debug!(evicted, "eviction sweep removed sessions");
                    }
                }
            }
        }
    })
}
