//! Multi-granularity sliding-window statistics.
//!
//! Five windows (1/3/5/10/15 minutes) each hold `(timestamp, delta)` points
//! appended at every snapshot; points older than the window span are pruned
//! on append. Deltas are computed against the previous cumulative summary
//! and clamped at zero so a counter reset cannot produce negative rates.

use std::collections::HashMap;

use serde::Serialize;

use crate::collector::MetricsSummary;

/// Window names in ascending span order.
pub const WINDOW_NAMES: [&str; 5] = ["1m", "3m", "5m", "10m", "15m"];

fn window_span_secs(name: &str) -> f64 {
    match name {
        "1m" => 60.0,
        "3m" => 180.0,
        "5m" => 300.0,
        "10m" => 600.0,
        _ => 900.0,
    }
}

/// One snapshot's increment over the previous one.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Delta {
    received: u64,
    success: u64,
    failed: u64,
    avg_latency_ms: f64,
    queue_size: usize,
}

/// Aggregate statistics over one window.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct WindowStats {
    /// Σ received over the actual covered span.
    pub throughput_per_second: f64,
    /// Unweighted mean of the per-point average latencies, taken over points
    /// whose latency sample is non-zero.
    pub avg_latency_ms: f64,
    /// Σ success / Σ received, in percent.
    pub success_rate: f64,
    /// Σ received within the window.
    pub total_messages: u64,
    /// Σ failed within the window.
    pub failed_messages: u64,
    /// Mean observed queue depth.
    pub avg_queue_size: f64,
    /// Configured window span in seconds.
    pub window_duration_secs: f64,
    /// Points currently held.
    pub data_points: usize,
}

struct TimeWindow {
    span_secs: f64,
    points: Vec<(f64, Delta)>,
}

impl TimeWindow {
    fn new(span_secs: f64) -> Self {
        Self {
            span_secs,
            points: Vec::new(),
        }
    }

    fn add(&mut self, timestamp: f64, delta: Delta) {
        self.points.push((timestamp, delta));
        let cutoff = timestamp - self.span_secs;
        self.points.retain(|(t, _)| *t >= cutoff);
    }

    #[allow(clippy::cast_precision_loss)]
    fn stats(&self) -> WindowStats {
        if self.points.is_empty() {
            return WindowStats {
                window_duration_secs: self.span_secs,
                ..Default::default()
            };
        }

        let total_received: u64 = self.points.iter().map(|(_, d)| d.received).sum();
        let total_success: u64 = self.points.iter().map(|(_, d)| d.success).sum();
        let total_failed: u64 = self.points.iter().map(|(_, d)| d.failed).sum();

        let first = self.points.first().map(|(t, _)| *t).unwrap_or_default();
        let last = self.points.last().map(|(t, _)| *t).unwrap_or_default();
        let actual_span = (last - first).max(1.0);

        let latencies: Vec<f64> = self
            .points
            .iter()
            .map(|(_, d)| d.avg_latency_ms)
            .filter(|l| *l > 0.0)
            .collect();
        let avg_latency = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };

        let avg_queue = self.points.iter().map(|(_, d)| d.queue_size as f64).sum::<f64>()
            / self.points.len() as f64;

        WindowStats {
            throughput_per_second: total_received as f64 / actual_span,
            avg_latency_ms: avg_latency,
            success_rate: (total_success as f64 / total_received.max(1) as f64) * 100.0,
            total_messages: total_received,
            failed_messages: total_failed,
            avg_queue_size: avg_queue,
            window_duration_secs: self.span_secs,
            data_points: self.points.len(),
        }
    }
}

/// Manager over the five standard windows.
pub struct SlidingWindows {
    windows: Vec<(&'static str, TimeWindow)>,
    last_snapshot: Option<MetricsSummary>,
}

impl Default for SlidingWindows {
    fn default() -> Self {
        Self::new()
    }
}

impl SlidingWindows {
    /// Fresh manager with empty windows.
    #[must_use]
    pub fn new() -> Self {
        Self {
            windows: WINDOW_NAMES
                .iter()
                .map(|name| (*name, TimeWindow::new(window_span_secs(name))))
                .collect(),
            last_snapshot: None,
        }
    }

    /// Append a snapshot taken at `timestamp_secs` (unix seconds).
    ///
    /// The first call records a zero delta and establishes the baseline.
    pub fn update_at(&mut self, timestamp_secs: f64, current: &MetricsSummary) {
        let delta = match &self.last_snapshot {
            None => Delta {
                queue_size: current.dispatch_queue_size,
                ..Default::default()
            },
            Some(prev) => Delta {
                received: current.received_total.saturating_sub(prev.received_total),
                success: current
                    .dispatched_success
                    .saturating_sub(prev.dispatched_success),
                failed: current
                    .dispatched_failed
                    .saturating_sub(prev.dispatched_failed),
                avg_latency_ms: current.dispatch_latency.avg_ms,
                queue_size: current.dispatch_queue_size,
            },
        };
        for (_, window) in &mut self.windows {
            window.add(timestamp_secs, delta);
        }
        self.last_snapshot = Some(current.clone());
    }

    /// Statistics for one window by name (`1m`, `3m`, `5m`, `10m`, `15m`).
    #[must_use]
    pub fn window_stats(&self, name: &str) -> Option<WindowStats> {
        self.windows
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, w)| w.stats())
    }

    /// Statistics for every window.
    #[must_use]
    pub fn all_windows(&self) -> HashMap<String, WindowStats> {
        self.windows
            .iter()
            .map(|(name, window)| ((*name).to_owned(), window.stats()))
            .collect()
    }

    /// Drop every point and the delta baseline.
    pub fn reset(&mut self) {
        for (_, window) in &mut self.windows {
            window.points.clear();
        }
        self.last_snapshot = None;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MetricsCollector;

    fn summary(received: u64, success: u64, failed: u64) -> MetricsSummary {
        let metrics = MetricsCollector::new();
        for _ in 0..received {
            metrics.record_received();
        }
        for _ in 0..success {
            metrics.record_dispatch_success(2.0);
        }
        for _ in 0..failed {
            metrics.record_dispatch_failure();
        }
        metrics.summary()
    }

    #[test]
    fn first_update_is_zero_delta() {
        let mut windows = SlidingWindows::new();
        windows.update_at(1000.0, &summary(100, 90, 10));
        let stats = windows.window_stats("1m").unwrap();
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.data_points, 1);
    }

    #[test]
    fn deltas_accumulate() {
        let mut windows = SlidingWindows::new();
        windows.update_at(1000.0, &summary(0, 0, 0));
        windows.update_at(1010.0, &summary(50, 40, 5));
        windows.update_at(1020.0, &summary(80, 70, 6));

        let stats = windows.window_stats("1m").unwrap();
        assert_eq!(stats.total_messages, 80);
        assert_eq!(stats.failed_messages, 6);
        // 80 received over 20 s of covered span.
        assert!((stats.throughput_per_second - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn counter_reset_clamps_to_zero() {
        let mut windows = SlidingWindows::new();
        windows.update_at(1000.0, &summary(100, 90, 0));
        windows.update_at(1010.0, &summary(10, 5, 0));
        let stats = windows.window_stats("1m").unwrap();
        assert_eq!(stats.total_messages, 0);
    }

    #[test]
    fn old_points_pruned_per_window() {
        let mut windows = SlidingWindows::new();
        windows.update_at(0.0, &summary(0, 0, 0));
        windows.update_at(10.0, &summary(10, 10, 0));
        // 100 s later: beyond the 1 m window but within 3 m.
        windows.update_at(110.0, &summary(20, 20, 0));

        assert_eq!(windows.window_stats("1m").unwrap().data_points, 1);
        assert_eq!(windows.window_stats("3m").unwrap().data_points, 3);
    }

    #[test]
    fn success_rate_over_window() {
        let mut windows = SlidingWindows::new();
        windows.update_at(0.0, &summary(0, 0, 0));
        windows.update_at(10.0, &summary(100, 80, 20));
        let stats = windows.window_stats("5m").unwrap();
        assert!((stats.success_rate - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn latency_ignores_zero_points() {
        let mut windows = SlidingWindows::new();
        windows.update_at(0.0, &summary(0, 0, 0));
        // No dispatch successes → zero latency point, excluded from the mean.
        windows.update_at(10.0, &summary(10, 0, 0));
        windows.update_at(20.0, &summary(20, 10, 0));

        let stats = windows.window_stats("1m").unwrap();
        assert!((stats.avg_latency_ms - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_window_is_none() {
        let windows = SlidingWindows::new();
        assert!(windows.window_stats("2m").is_none());
    }

    #[test]
    fn all_windows_has_five_entries() {
        let windows = SlidingWindows::new();
        let all = windows.all_windows();
        assert_eq!(all.len(), 5);
        assert!(all.contains_key("15m"));
        assert!((all["10m"].window_duration_secs - 600.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reset_clears_baseline() {
        let mut windows = SlidingWindows::new();
        windows.update_at(0.0, &summary(100, 100, 0));
        windows.reset();
        windows.update_at(10.0, &summary(200, 150, 0));
        // Post-reset first update is a zero delta again.
        assert_eq!(windows.window_stats("1m").unwrap().total_messages, 0);
    }
}
