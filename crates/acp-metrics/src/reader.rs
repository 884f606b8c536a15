//! Standalone read-only access to a persisted metrics store.
//!
//! A separate process (dashboard, debugging tool) can open the same
//! database file read-only, page through snapshots, and recompute
//! sliding-window statistics from the stored cumulative points.

use std::collections::HashMap;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};

use acp_core::errors::PersistenceError;

use crate::collector::{LatencyStats, MetricsSummary};
use crate::store::SnapshotRow;
use crate::windows::{SlidingWindows, WindowStats};

/// Read-only view over a metrics time-series database.
pub struct StandaloneReader {
    conn: Mutex<Connection>,
}

impl StandaloneReader {
    /// Open `path` read-only; fails if the file does not exist.
    pub fn open(path: &str) -> Result<Self, PersistenceError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| PersistenceError::new("metrics_timeseries", "open", e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Snapshots in `[from_ts, to_ts]` for `agent_id`, ascending.
    pub fn query_range(
        &self,
        from_ts: i64,
        to_ts: i64,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<SnapshotRow>, PersistenceError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT timestamp, agent_id, received_total, dispatched_success,
                        dispatched_failed, handler_success, handler_failed,
                        dispatch_queue_size, avg_dispatch_latency_ms,
                        avg_handler_latency_ms, p50_dispatch_latency_ms,
                        p95_dispatch_latency_ms, p99_dispatch_latency_ms,
                        throughput_per_second, success_rate
                 FROM metrics_timeseries
                 WHERE timestamp >= ?1 AND timestamp <= ?2 AND agent_id = ?3
                 ORDER BY timestamp ASC LIMIT ?4",
            )
            .map_err(|e| PersistenceError::new("metrics_timeseries", "query", e.to_string()))?;
        let rows = stmt
            .query_map(
                rusqlite::params![from_ts, to_ts, agent_id, i64::try_from(limit).unwrap_or(i64::MAX)],
                |row| {
                    Ok(SnapshotRow {
                        timestamp: row.get(0)?,
                        agent_id: row.get(1)?,
                        received_total: row.get::<_, i64>(2)?.max(0).unsigned_abs(),
                        dispatched_success: row.get::<_, i64>(3)?.max(0).unsigned_abs(),
                        dispatched_failed: row.get::<_, i64>(4)?.max(0).unsigned_abs(),
                        handler_success: row.get::<_, i64>(5)?.max(0).unsigned_abs(),
                        handler_failed: row.get::<_, i64>(6)?.max(0).unsigned_abs(),
                        dispatch_queue_size: row.get(7)?,
                        avg_dispatch_latency_ms: row.get(8)?,
                        avg_handler_latency_ms: row.get(9)?,
                        p50_dispatch_latency_ms: row.get(10)?,
                        p95_dispatch_latency_ms: row.get(11)?,
                        p99_dispatch_latency_ms: row.get(12)?,
                        throughput_per_second: row.get(13)?,
                        success_rate: row.get(14)?,
                    })
                },
            )
            .map_err(|e| PersistenceError::new("metrics_timeseries", "query", e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| PersistenceError::new("metrics_timeseries", "query", e.to_string()))
    }

    /// Recompute window statistics from stored points.
    ///
    /// Feeds the rows through the same sliding-window logic the live
    /// service uses, so a post-hoc view matches what the agent observed.
    pub fn windows_over(
        &self,
        from_ts: i64,
        to_ts: i64,
        agent_id: &str,
    ) -> Result<HashMap<String, WindowStats>, PersistenceError> {
        let rows = self.query_range(from_ts, to_ts, agent_id, 10_000)?;
        let mut windows = SlidingWindows::new();
        for row in &rows {
            #[allow(clippy::cast_precision_loss)]
            windows.update_at(row.timestamp as f64, &summary_from_row(row));
        }
        Ok(windows.all_windows())
    }
}

fn summary_from_row(row: &SnapshotRow) -> MetricsSummary {
    MetricsSummary {
        received_total: row.received_total,
        dispatched_success: row.dispatched_success,
        dispatched_failed: row.dispatched_failed,
        handler_success: row.handler_success,
        handler_failed: row.handler_failed,
        dispatch_queue_size: usize::try_from(row.dispatch_queue_size).unwrap_or(0),
        dispatch_success_rate: row.success_rate,
        handler_success_rate: 0.0,
        dispatch_latency: LatencyStats {
            avg_ms: row.avg_dispatch_latency_ms,
            p50_ms: row.p50_dispatch_latency_ms,
            p95_ms: row.p95_dispatch_latency_ms,
            p99_ms: row.p99_dispatch_latency_ms,
        },
        handler_latency: LatencyStats {
            avg_ms: row.avg_handler_latency_ms,
            ..Default::default()
        },
        messages_per_second: row.throughput_per_second,
        uptime_seconds: 0.0,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MetricsCollector;
    use crate::store::MetricsStore;

    fn seeded_db(dir: &tempfile::TempDir) -> String {
        let path = dir.path().join("metrics.db");
        let store = MetricsStore::open(path.to_str().unwrap()).unwrap();
        let collector = MetricsCollector::new();
        for ts in [1000, 1010, 1020] {
            collector.record_received();
            collector.record_dispatch_success(4.0);
            let _ = store
                .insert_snapshot("a.corp.example", ts, &collector.summary())
                .unwrap();
        }
        path.to_str().unwrap().to_owned()
    }

    #[test]
    fn open_missing_file_fails() {
        assert!(StandaloneReader::open("/nonexistent/metrics.db").is_err());
    }

    #[test]
    fn reads_rows_written_by_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_db(&dir);
        let reader = StandaloneReader::open(&path).unwrap();

        let rows = reader.query_range(0, 2000, "a.corp.example", 100).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].received_total, 1);
        assert_eq!(rows[2].received_total, 3);
    }

    #[test]
    fn windows_recomputed_from_points() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_db(&dir);
        let reader = StandaloneReader::open(&path).unwrap();

        let windows = reader.windows_over(0, 2000, "a.corp.example").unwrap();
        let one_minute = &windows["1m"];
        // Deltas: baseline, +1, +1 → 2 messages over 20 s of span.
        assert_eq!(one_minute.total_messages, 2);
        assert_eq!(one_minute.data_points, 3);
        assert!((one_minute.throughput_per_second - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn filters_other_agents() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_db(&dir);
        let reader = StandaloneReader::open(&path).unwrap();
        let rows = reader.query_range(0, 2000, "b.corp.example", 100).unwrap();
        assert!(rows.is_empty());
    }
}
