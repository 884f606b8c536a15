//! Embedded time-series persistence for metric snapshots.
//!
//! One table keyed by timestamp with a secondary index on
//! `(agent_id, timestamp)`. Snapshot writes run behind a try-lock and are
//! silently skipped on contention so the monitoring loop never stalls the
//! hot path; reads take the lock normally.

use parking_lot::Mutex;
use rusqlite::{Connection, params};
use tracing::{debug, warn};

use acp_core::errors::PersistenceError;

use crate::collector::MetricsSummary;

/// Table name for the snapshot series.
const TABLE: &str = "metrics_timeseries";

/// One persisted snapshot row.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotRow {
    /// Unix-second timestamp (primary key).
    pub timestamp: i64,
    /// Identity the snapshot belongs to.
    pub agent_id: String,
    /// Cumulative received count.
    pub received_total: u64,
    /// Cumulative dispatch successes.
    pub dispatched_success: u64,
    /// Cumulative dispatch failures.
    pub dispatched_failed: u64,
    /// Cumulative handler successes.
    pub handler_success: u64,
    /// Cumulative handler failures.
    pub handler_failed: u64,
    /// Queue depth at snapshot time.
    pub dispatch_queue_size: i64,
    /// Mean dispatch latency.
    pub avg_dispatch_latency_ms: f64,
    /// Mean handler latency.
    pub avg_handler_latency_ms: f64,
    /// p50 dispatch latency.
    pub p50_dispatch_latency_ms: f64,
    /// p95 dispatch latency.
    pub p95_dispatch_latency_ms: f64,
    /// p99 dispatch latency.
    pub p99_dispatch_latency_ms: f64,
    /// Lifetime throughput at snapshot time.
    pub throughput_per_second: f64,
    /// Lifetime dispatch success rate at snapshot time.
    pub success_rate: f64,
}

/// SQLite-backed snapshot store.
pub struct MetricsStore {
    conn: Mutex<Connection>,
}

type StoreResult<T> = Result<T, PersistenceError>;

fn db_err(operation: &str, e: &rusqlite::Error) -> PersistenceError {
    PersistenceError::new(TABLE, operation, e.to_string())
}

impl MetricsStore {
    /// Open (and migrate) the store at `path`.
    pub fn open(path: &str) -> StoreResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| PersistenceError::new(TABLE, "open", e.to_string()))?;
        Self::with_connection(conn)
    }

    /// In-memory store, for tests.
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PersistenceError::new(TABLE, "open", e.to_string()))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {TABLE} (
                 timestamp INTEGER PRIMARY KEY,
                 agent_id TEXT NOT NULL,
                 received_total INTEGER DEFAULT 0,
                 dispatched_success INTEGER DEFAULT 0,
                 dispatched_failed INTEGER DEFAULT 0,
                 handler_success INTEGER DEFAULT 0,
                 handler_failed INTEGER DEFAULT 0,
                 dispatch_queue_size INTEGER DEFAULT 0,
                 avg_dispatch_latency_ms REAL DEFAULT 0.0,
                 avg_handler_latency_ms REAL DEFAULT 0.0,
                 p50_dispatch_latency_ms REAL DEFAULT 0.0,
                 p95_dispatch_latency_ms REAL DEFAULT 0.0,
                 p99_dispatch_latency_ms REAL DEFAULT 0.0,
                 throughput_per_second REAL DEFAULT 0.0,
                 success_rate REAL DEFAULT 0.0
             );
             CREATE INDEX IF NOT EXISTS idx_{TABLE}_agent_ts
                 ON {TABLE}(agent_id, timestamp);"
        ))
        .map_err(|e| db_err("migrate", &e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Persist one snapshot.
    ///
    /// Non-blocking: if another operation holds the store, this write is
    /// skipped (returns `Ok(false)`) rather than stalling the caller.
    pub fn insert_snapshot(
        &self,
        agent_id: &str,
        timestamp: i64,
        summary: &MetricsSummary,
    ) -> StoreResult<bool> {
        let Some(conn) = self.conn.try_lock() else {
            debug!("metrics store contended, snapshot skipped");
            return Ok(false);
        };
        let _ = conn
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO {TABLE} (
                         timestamp, agent_id, received_total, dispatched_success,
                         dispatched_failed, handler_success, handler_failed,
                         dispatch_queue_size, avg_dispatch_latency_ms,
                         avg_handler_latency_ms, p50_dispatch_latency_ms,
                         p95_dispatch_latency_ms, p99_dispatch_latency_ms,
                         throughput_per_second, success_rate
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    timestamp,
                    agent_id,
                    i64::try_from(summary.received_total).unwrap_or(i64::MAX),
                    i64::try_from(summary.dispatched_success).unwrap_or(i64::MAX),
                    i64::try_from(summary.dispatched_failed).unwrap_or(i64::MAX),
                    i64::try_from(summary.handler_success).unwrap_or(i64::MAX),
                    i64::try_from(summary.handler_failed).unwrap_or(i64::MAX),
                    i64::try_from(summary.dispatch_queue_size).unwrap_or(i64::MAX),
                    summary.dispatch_latency.avg_ms,
                    summary.handler_latency.avg_ms,
                    summary.dispatch_latency.p50_ms,
                    summary.dispatch_latency.p95_ms,
                    summary.dispatch_latency.p99_ms,
                    summary.messages_per_second,
                    summary.dispatch_success_rate,
                ],
            )
            .map_err(|e| db_err("insert", &e))?;
        Ok(true)
    }

    fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotRow> {
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
    }

    const COLUMNS: &'static str = "timestamp, agent_id, received_total, dispatched_success,
        dispatched_failed, handler_success, handler_failed, dispatch_queue_size,
        avg_dispatch_latency_ms, avg_handler_latency_ms, p50_dispatch_latency_ms,
        p95_dispatch_latency_ms, p99_dispatch_latency_ms, throughput_per_second, success_rate";

    /// Snapshots within `[from_ts, to_ts]`, ascending, optionally filtered
    /// by agent.
    pub fn query_range(
        &self,
        from_ts: i64,
        to_ts: i64,
        agent_id: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<SnapshotRow>> {
        let conn = self.conn.lock();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match agent_id {
            Some(agent_id) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM {TABLE}
                         WHERE timestamp >= ?1 AND timestamp <= ?2 AND agent_id = ?3
                         ORDER BY timestamp ASC LIMIT ?4",
                        Self::COLUMNS
                    ))
                    .map_err(|e| db_err("query", &e))?;
                let mapped = stmt
                    .query_map(params![from_ts, to_ts, agent_id, limit], Self::row_to_snapshot)
                    .map_err(|e| db_err("query", &e))?;
                mapped.collect::<rusqlite::Result<Vec<_>>>()
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM {TABLE}
                         WHERE timestamp >= ?1 AND timestamp <= ?2
                         ORDER BY timestamp ASC LIMIT ?3",
                        Self::COLUMNS
                    ))
                    .map_err(|e| db_err("query", &e))?;
                let mapped = stmt
                    .query_map(params![from_ts, to_ts, limit], Self::row_to_snapshot)
                    .map_err(|e| db_err("query", &e))?;
                mapped.collect::<rusqlite::Result<Vec<_>>>()
            }
        };
        rows.map_err(|e| db_err("query", &e))
    }

    /// Most recent snapshots, descending.
    pub fn query_latest(
        &self,
        agent_id: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<SnapshotRow>> {
        let conn = self.conn.lock();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match agent_id {
            Some(agent_id) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM {TABLE} WHERE agent_id = ?1
                         ORDER BY timestamp DESC LIMIT ?2",
                        Self::COLUMNS
                    ))
                    .map_err(|e| db_err("query", &e))?;
                let mapped = stmt
                    .query_map(params![agent_id, limit], Self::row_to_snapshot)
                    .map_err(|e| db_err("query", &e))?;
                mapped.collect::<rusqlite::Result<Vec<_>>>()
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM {TABLE} ORDER BY timestamp DESC LIMIT ?1",
                        Self::COLUMNS
                    ))
                    .map_err(|e| db_err("query", &e))?;
                let mapped = stmt
                    .query_map(params![limit], Self::row_to_snapshot)
                    .map_err(|e| db_err("query", &e))?;
                mapped.collect::<rusqlite::Result<Vec<_>>>()
            }
        };
        rows.map_err(|e| db_err("query", &e))
    }

    /// Delete rows older than `retention_days`; returns how many.
    pub fn cleanup_old(&self, now_ts: i64, retention_days: i64) -> StoreResult<usize> {
        let cutoff = now_ts - retention_days * 86_400;
        let conn = self.conn.lock();
        let deleted = conn
            .execute(
                &format!("DELETE FROM {TABLE} WHERE timestamp < ?1"),
                params![cutoff],
            )
            .map_err(|e| db_err("delete", &e))?;
        if deleted > 0 {
            warn!(deleted, retention_days, "expired metric snapshots removed");
        }
        Ok(deleted)
    }

    /// Row count, covered time range, and distinct agent count.
    pub fn stats(&self) -> StoreResult<(usize, Option<(i64, i64)>, usize)> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {TABLE}"), [], |r| r.get(0))
            .map_err(|e| db_err("query", &e))?;
        let range: (Option<i64>, Option<i64>) = conn
            .query_row(
                &format!("SELECT MIN(timestamp), MAX(timestamp) FROM {TABLE}"),
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(|e| db_err("query", &e))?;
        let agents: i64 = conn
            .query_row(
                &format!("SELECT COUNT(DISTINCT agent_id) FROM {TABLE}"),
                [],
                |r| r.get(0),
            )
            .map_err(|e| db_err("query", &e))?;
        let range = match range {
            (Some(min), Some(max)) => Some((min, max)),
            _ => None,
        };
        Ok((
            usize::try_from(count).unwrap_or(0),
            range,
            usize::try_from(agents).unwrap_or(0),
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
