//! # acp-metrics
//!
//! In-process observability for the dispatch pipeline:
//!
//! - [`MetricsCollector`]: counters and bounded latency samples
//! - [`windows`]: multi-granularity sliding-window statistics
//! - [`store`]: embedded time-series persistence
//! - [`MonitoringService`]: the periodic snapshot loop tying them together
//! - [`reader`]: standalone read-only access to a persisted store

pub mod collector;
pub mod reader;
pub mod service;
pub mod store;
pub mod windows;

pub use collector::{MetricsCollector, MetricsSummary};
pub use reader::StandaloneReader;
pub use service::MonitoringService;
pub use store::{MetricsStore, SnapshotRow};
pub use windows::{SlidingWindows, WindowStats};
