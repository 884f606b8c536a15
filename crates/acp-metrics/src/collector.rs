//! Message-processing metrics collector.
//!
//! Counters plus bounded latency rings (1000 samples each) for the dispatch
//! and handler stages. All records run under one mutex; percentiles sort
//! the active sample set, which is small enough that O(n log n) is fine.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

/// Samples retained per latency ring.
const MAX_LATENCY_SAMPLES: usize = 1000;

#[derive(Default)]
struct Counters {
    received_total: u64,
    dispatched_success: u64,
    dispatched_failed: u64,
    handler_success: u64,
    handler_failed: u64,
    dispatch_queue_size: usize,
    dispatch_latencies: VecDeque<f64>,
    handler_latencies: VecDeque<f64>,
}

/// Latency distribution over one ring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    /// Mean over the retained samples, in milliseconds.
    pub avg_ms: f64,
    /// 50th percentile.
    pub p50_ms: f64,
    /// 95th percentile.
    pub p95_ms: f64,
    /// 99th percentile.
    pub p99_ms: f64,
}

/// Point-in-time summary of every metric.
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSummary {
    /// Messages observed by the transport callback.
    pub received_total: u64,
    /// Successful scheduler submissions.
    pub dispatched_success: u64,
    /// Dropped or rejected messages.
    pub dispatched_failed: u64,
    /// Handler invocations that returned cleanly.
    pub handler_success: u64,
    /// Handler invocations that failed or timed out.
    pub handler_failed: u64,
    /// Current dispatch queue depth.
    pub dispatch_queue_size: usize,
    /// `dispatched_success / received_total`, in percent.
    pub dispatch_success_rate: f64,
    /// `handler_success / dispatched_success`, in percent.
    pub handler_success_rate: f64,
    /// Dispatch-stage latency distribution.
    pub dispatch_latency: LatencyStats,
    /// Handler-stage latency distribution.
    pub handler_latency: LatencyStats,
    /// Messages per second since start.
    pub messages_per_second: f64,
    /// Seconds since construction or reset.
    pub uptime_seconds: f64,
}

/// Thread-safe metrics collector for one identity.
pub struct MetricsCollector {
    inner: Mutex<Counters>,
    start: Mutex<Instant>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Fresh collector; the uptime clock starts now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Counters::default()),
            start: Mutex::new(Instant::now()),
        }
    }

    /// A message arrived from the transport.
    pub fn record_received(&self) {
        self.inner.lock().received_total += 1;
    }

    /// A message was handed to the scheduler; `latency_ms` measures the
    /// dispatcher stage.
    pub fn record_dispatch_success(&self, latency_ms: f64) {
        let mut inner = self.inner.lock();
        inner.dispatched_success += 1;
        push_sample(&mut inner.dispatch_latencies, latency_ms);
    }

    /// A message was dropped before reaching a worker.
    pub fn record_dispatch_failure(&self) {
        self.inner.lock().dispatched_failed += 1;
    }

    /// A handler invocation completed.
    pub fn record_handler_success(&self, latency_ms: f64) {
        let mut inner = self.inner.lock();
        inner.handler_success += 1;
        push_sample(&mut inner.handler_latencies, latency_ms);
    }

    /// A handler invocation failed or timed out.
    pub fn record_handler_failure(&self) {
        self.inner.lock().handler_failed += 1;
    }

    /// Update the observed dispatch queue depth.
    pub fn update_dispatch_queue_size(&self, size: usize) {
        self.inner.lock().dispatch_queue_size = size;
    }

    /// Compute the full summary.
    #[must_use]
    pub fn summary(&self) -> MetricsSummary {
        let inner = self.inner.lock();
        let uptime = self.start.lock().elapsed().as_secs_f64();

        let dispatch_rate = if inner.received_total > 0 {
            percentage(inner.dispatched_success, inner.received_total)
        } else {
            0.0
        };
        let handler_rate = if inner.dispatched_success > 0 {
            percentage(inner.handler_success, inner.dispatched_success)
        } else {
            0.0
        };

        #[allow(clippy::cast_precision_loss)]
        let throughput = inner.received_total as f64 / uptime.max(1.0);

        MetricsSummary {
            received_total: inner.received_total,
            dispatched_success: inner.dispatched_success,
            dispatched_failed: inner.dispatched_failed,
            handler_success: inner.handler_success,
            handler_failed: inner.handler_failed,
            dispatch_queue_size: inner.dispatch_queue_size,
            dispatch_success_rate: dispatch_rate,
            handler_success_rate: handler_rate,
            dispatch_latency: latency_stats(&inner.dispatch_latencies),
            handler_latency: latency_stats(&inner.handler_latencies),
            messages_per_second: throughput,
            uptime_seconds: uptime,
        }
    }

    /// Clear every counter and restart the uptime clock.
    pub fn reset(&self) {
        *self.inner.lock() = Counters::default();
        *self.start.lock() = Instant::now();
    }
}

fn push_sample(ring: &mut VecDeque<f64>, value: f64) {
    if ring.len() >= MAX_LATENCY_SAMPLES {
        let _ = ring.pop_front();
    }
    ring.push_back(value);
}

#[allow(clippy::cast_precision_loss)]
fn percentage(part: u64, whole: u64) -> f64 {
    (part as f64 / whole.max(1) as f64) * 100.0
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn latency_stats(ring: &VecDeque<f64>) -> LatencyStats {
    if ring.is_empty() {
        return LatencyStats::default();
    }
    let mut sorted: Vec<f64> = ring.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    let pick = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];
    LatencyStats {
        avg_ms: sorted.iter().sum::<f64>() / n as f64,
        p50_ms: pick(0.50),
        p95_ms: pick(0.95),
        p99_ms: pick(0.99),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = MetricsCollector::new();
        metrics.record_received();
        metrics.record_received();
        metrics.record_dispatch_success(5.0);
        metrics.record_dispatch_failure();
        metrics.record_handler_success(100.0);
        metrics.record_handler_failure();
        metrics.update_dispatch_queue_size(3);

        let summary = metrics.summary();
        assert_eq!(summary.received_total, 2);
        assert_eq!(summary.dispatched_success, 1);
        assert_eq!(summary.dispatched_failed, 1);
        assert_eq!(summary.handler_success, 1);
        assert_eq!(summary.handler_failed, 1);
        assert_eq!(summary.dispatch_queue_size, 3);
    }

    #[test]
    fn success_rates() {
        let metrics = MetricsCollector::new();
        for _ in 0..4 {
            metrics.record_received();
        }
        metrics.record_dispatch_success(1.0);
        metrics.record_dispatch_success(1.0);
        metrics.record_handler_success(1.0);

        let summary = metrics.summary();
        assert!((summary.dispatch_success_rate - 50.0).abs() < f64::EPSILON);
        assert!((summary.handler_success_rate - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_summary_is_zero() {
        let summary = MetricsCollector::new().summary();
        assert_eq!(summary.received_total, 0);
        assert!(summary.dispatch_success_rate.abs() < f64::EPSILON);
        assert_eq!(summary.dispatch_latency, LatencyStats::default());
    }

    #[test]
    fn latency_ring_bounded() {
        let metrics = MetricsCollector::new();
        for i in 0..1500 {
            metrics.record_dispatch_success(f64::from(i));
        }
        let inner = metrics.inner.lock();
        assert_eq!(inner.dispatch_latencies.len(), 1000);
        // Oldest samples were evicted.
        assert!((inner.dispatch_latencies.front().copied().unwrap() - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn percentiles_from_sorted_samples() {
        let metrics = MetricsCollector::new();
        for i in 1..=100 {
            metrics.record_handler_success(f64::from(i));
        }
        let stats = metrics.summary().handler_latency;
        assert!((stats.avg_ms - 50.5).abs() < 0.01);
        assert!((stats.p50_ms - 51.0).abs() < f64::EPSILON);
        assert!((stats.p95_ms - 96.0).abs() < f64::EPSILON);
        assert!((stats.p99_ms - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reset_clears_everything() {
        let metrics = MetricsCollector::new();
        metrics.record_received();
        metrics.record_dispatch_success(1.0);
        metrics.reset();
        let summary = metrics.summary();
        assert_eq!(summary.received_total, 0);
        assert_eq!(summary.dispatched_success, 0);
        assert_eq!(summary.dispatch_latency, LatencyStats::default());
    }

    #[test]
    fn summary_serializes() {
        let metrics = MetricsCollector::new();
        metrics.record_received();
        let json = serde_json::to_value(metrics.summary()).unwrap();
        assert_eq!(json["received_total"], 1);
        assert!(json["dispatch_latency"]["avg_ms"].is_number());
    }
}
