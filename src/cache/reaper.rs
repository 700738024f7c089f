//! Expiry Reaper
//!
//! Background task that sweeps every tier on a fixed interval and compacts
//! the structured store. A sweep can also be requested on demand through
//! the [`ReaperHandle`].
//!
//! Sweep failures are logged per tier and never stop the loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::manager::CacheManager;
use crate::config::MAX_REAPER_INTERVAL_HOURS;

const MIN_INTERVAL: Duration = Duration::from_millis(1);
const MAX_INTERVAL: Duration = Duration::from_secs(MAX_REAPER_INTERVAL_HOURS * 3600);

/// Periodic expiry sweeper
pub struct ExpiryReaper {
    manager: Arc<CacheManager>,
    interval: Duration,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
    sweeps: Arc<AtomicU64>,
}

impl ExpiryReaper {
    /// Start the reaper on the current runtime.
    ///
    /// The first sweep runs one `interval` after start. The interval is
    /// clamped to between one millisecond and one year.
    pub fn spawn(manager: Arc<CacheManager>, interval: Duration) -> ReaperHandle {
        let reaper = Arc::new(Self {
            manager,
            interval: interval.clamp(MIN_INTERVAL, MAX_INTERVAL),
            trigger: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            sweeps: Arc::new(AtomicU64::new(0)),
        });

        let trigger = Arc::clone(&reaper.trigger);
        let cancel = reaper.cancel.clone();
        let sweeps = Arc::clone(&reaper.sweeps);
        let task = tokio::spawn(reaper.run());

        ReaperHandle {
            trigger,
            cancel,
            sweeps,
            task: Some(task),
        }
    }

    #[instrument(skip(self), fields(interval = ?self.interval))]
    async fn run(self: Arc<Self>) {
        info!("Starting expiry reaper");

        let mut tick = interval_at(Instant::now() + self.interval, self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Expiry reaper shutting down");
                    break;
                }
                _ = tick.tick() => self.sweep().await,
                _ = self.trigger.notified() => self.sweep().await,
            }
        }
    }

    async fn sweep(&self) {
        let report = self.manager.cleanup_expired().await;
        let n = self.sweeps.fetch_add(1, Ordering::Relaxed) + 1;

        for (tier, reason) in &report.failures {
            error!(sweep = n, %tier, "Sweep failed: {}", reason);
        }
        info!(
            sweep = n,
            removed = report.total_removed(),
            compacted = report.compacted,
            "Expiry sweep finished"
        );

        let stats = self.manager.stats().await;
        let used = stats.disk_bytes_used();
        if used > stats.max_disk_bytes {
            warn!(
                used_bytes = used,
                budget_bytes = stats.max_disk_bytes,
                "Disk and compressed tiers exceed the configured disk budget"
            );
        }
    }
}

/// Control handle for a running [`ExpiryReaper`]
pub struct ReaperHandle {
    trigger: Arc<Notify>,
    cancel: CancellationToken,
    sweeps: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    /// Request an immediate sweep
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Completed sweeps so far
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop and wait for an in-flight sweep to finish
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Expiry reaper task failed: {}", e);
            }
        }
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================
