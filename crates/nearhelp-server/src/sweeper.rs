//! Background maintenance tasks.
//!
//! The expiry sweeper drives every time-based transition; nothing expires
//! lazily on read.  The retention sweep runs far less often and drops
//! requests past the storage horizon.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use nearhelp_core::now_utc;

use crate::config::ServerConfig;
use crate::coordinator::Coordinator;

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Spawn the periodic expiry sweep.
pub fn spawn_expiry_sweeper(
    coordinator: Coordinator,
    config: Arc<ServerConfig>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(config.sweep_interval_secs));
        // A missed tick (slow sweep) should not cause a burst afterwards.
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match coordinator.expire_due(now_utc()).await {
                Ok(expired) => {
                    if !expired.is_empty() {
                        debug!(count = expired.len(), "Expiry sweep finished");
                    }
                }
                Err(e) => error!(error = %e, "Expiry sweep failed"),
            }
        }
    })
}

/// Spawn the daily retention sweep.
pub fn spawn_retention_sweeper(coordinator: Coordinator) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = coordinator.purge_aged(now_utc()).await {
                error!(error = %e, "Retention sweep failed");
            }
        }
    })
}
