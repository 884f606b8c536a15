//! Periodic monitoring loop.
//!
//! Every `snapshot_interval` (10 s by default) the service reads the
//! collector summary, folds it into the sliding windows, and persists a
//! snapshot row; once an hour it prunes rows older than the retention
//! window. Persistence problems are logged and skipped so the loop can
//! never stall message processing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collector::MetricsCollector;
use crate::store::{MetricsStore, SnapshotRow};
use crate::windows::{SlidingWindows, WindowStats};

/// Default snapshot cadence.
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10);
/// Cleanup cadence.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
/// Snapshot retention in days.
const RETENTION_DAYS: i64 = 7;

fn now_secs() -> i64 {
    i64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    )
    .unwrap_or(i64::MAX)
}

/// Monitoring service for one identity.
pub struct MonitoringService {
    agent_id: String,
    collector: Arc<MetricsCollector>,
    store: Arc<MetricsStore>,
    windows: Arc<Mutex<SlidingWindows>>,
    snapshot_interval: Duration,
    snapshot_count: Arc<AtomicU64>,
    cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitoringService {
    /// Create a service persisting to the store at `db_path`.
    pub fn new(
        agent_id: &str,
        collector: Arc<MetricsCollector>,
        db_path: &str,
        snapshot_interval: Duration,
    ) -> Result<Self, acp_core::errors::PersistenceError> {
        let store = Arc::new(MetricsStore::open(db_path)?);
        Ok(Self {
            agent_id: agent_id.to_owned(),
            collector,
            store,
            windows: Arc::new(Mutex::new(SlidingWindows::new())),
            snapshot_interval,
            snapshot_count: Arc::new(AtomicU64::new(0)),
            cancel: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
        })
    }

    /// Whether the snapshot loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Snapshots taken since start.
    #[must_use]
    pub fn snapshot_count(&self) -> u64 {
        self.snapshot_count.load(Ordering::Relaxed)
    }

    /// Start the snapshot loop; a second call while running is a no-op.
    pub fn start(&self) {
        if self.is_running() {
            warn!(agent_id = %self.agent_id, "monitoring service already running");
            return;
        }
        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();

        let agent_id = self.agent_id.clone();
        let collector = self.collector.clone();
        let store = self.store.clone();
        let windows = self.windows.clone();
        let count = self.snapshot_count.clone();
        let interval = self.snapshot_interval;

        let handle = tokio::spawn(async move {
            let mut last_cleanup = now_secs();
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = cancel.cancelled() => break,
                }
                take_snapshot(&agent_id, &collector, &store, &windows, &count);

                let now = now_secs();
                if now - last_cleanup > i64::try_from(CLEANUP_INTERVAL.as_secs()).unwrap_or(3600) {
                    last_cleanup = now;
                    if let Err(e) = store.cleanup_old(now, RETENTION_DAYS) {
                        warn!(error = %e, "metric snapshot cleanup failed");
                    }
                }
            }
            debug!("monitoring snapshot loop stopped");
        });
        *self.task.lock() = Some(handle);
        info!(
            agent_id = %self.agent_id,
            interval_secs = self.snapshot_interval.as_secs(),
            "monitoring service started"
        );
    }

    /// Stop the loop.
    ///
    /// With `wait` the call joins the loop (bounded) and writes one final
    /// snapshot; without it only the stop signal is sent, so the caller's
    /// path never blocks.
    pub async fn stop(&self, wait: bool) {
        self.cancel.lock().cancel();
        if !wait {
            info!(agent_id = %self.agent_id, "monitoring service stop signalled");
            return;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let aborter = task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                aborter.abort();
            }
        }
        take_snapshot(
            &self.agent_id,
            &self.collector,
            &self.store,
            &self.windows,
            &self.snapshot_count,
        );
        info!(
            agent_id = %self.agent_id,
            snapshots = self.snapshot_count(),
            "monitoring service stopped"
        );
    }

    /// Cumulative metrics plus every window, as one JSON document.
    #[must_use]
    pub fn realtime_metrics(&self) -> Value {
        json!({
            "agent_id": self.agent_id,
            "timestamp": now_secs(),
            "cumulative": self.collector.summary(),
            "windows": self.windows.lock().all_windows(),
        })
    }

    /// Statistics for the named windows only.
    #[must_use]
    pub fn window_metrics(&self, names: &[&str]) -> Vec<(String, WindowStats)> {
        let windows = self.windows.lock();
        names
            .iter()
            .filter_map(|name| {
                windows
                    .window_stats(name)
                    .map(|stats| ((*name).to_owned(), stats))
            })
            .collect()
    }

    /// Persisted snapshots in `[from_ts, to_ts]` for this identity.
    pub fn history(
        &self,
        from_ts: i64,
        to_ts: i64,
        limit: usize,
    ) -> Result<Vec<SnapshotRow>, acp_core::errors::PersistenceError> {
        self.store
            .query_range(from_ts, to_ts, Some(&self.agent_id), limit)
    }

    /// Most recent persisted snapshots for this identity.
    pub fn latest_history(
        &self,
        limit: usize,
    ) -> Result<Vec<SnapshotRow>, acp_core::errors::PersistenceError> {
        self.store.query_latest(Some(&self.agent_id), limit)
    }

    /// Reset the sliding windows (testing hook).
    pub fn reset_windows(&self) {
        self.windows.lock().reset();
    }
}

#[allow(clippy::cast_precision_loss)]
fn take_snapshot(
    agent_id: &str,
    collector: &Arc<MetricsCollector>,
    store: &Arc<MetricsStore>,
    windows: &Arc<Mutex<SlidingWindows>>,
    count: &Arc<AtomicU64>,
) {
    let summary = collector.summary();
    let now = now_secs();

    windows.lock().update_at(now as f64, &summary);

    match store.insert_snapshot(agent_id, now, &summary) {
        Ok(true) => {}
        Ok(false) => debug!("snapshot write skipped under contention"),
        Err(e) => warn!(error = %e, "snapshot write failed"),
    }

    let n = count.fetch_add(1, Ordering::Relaxed) + 1;
    if n % 6 == 0 {
        debug!(
            agent_id,
            snapshot = n,
            received = summary.received_total,
            queue = summary.dispatch_queue_size,
            "monitoring snapshot"
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
