//! Runtime configuration types.
//!
//! Every knob recognised by the runtime, with the defaults the servers are
//! tuned for. All types deserialize with per-field defaults so partial
//! configuration files work.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

/// Default outbound buffer capacity.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 5000;
/// Default WebSocket handshake wait in seconds.
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: f64 = 3.0;
/// Default ping interval in seconds; health checks run at twice this.
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 3;
/// Default reconnect backoff base in seconds.
pub const DEFAULT_RECONNECT_BASE_SECS: f64 = 0.5;
/// Default reconnect backoff cap in seconds.
pub const DEFAULT_RECONNECT_MAX_SECS: f64 = 10.0;
/// Default reconnect backoff factor.
pub const DEFAULT_RECONNECT_BACKOFF_FACTOR: f64 = 1.5;
/// Default application-layer message size limit in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
/// Default connection attempts before a send is buffered.
pub const DEFAULT_SEND_RETRY_ATTEMPTS: u32 = 5;
/// Default delay between those attempts in milliseconds.
pub const DEFAULT_SEND_RETRY_DELAY_MS: u64 = 10;

/// Configuration for a message transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct TransportConfig {
    /// Outbound buffer capacity; oldest entries are dropped when exceeded.
    pub max_queue_size: usize,
    /// Wait for the initial handshake, in seconds.
    pub connection_timeout_secs: f64,
    /// Ping every N seconds; the health check runs every 2N seconds.
    pub ping_interval_secs: u64,
    /// First reconnect wait, in seconds.
    pub reconnect_base_secs: f64,
    /// Reconnect wait cap, in seconds.
    pub reconnect_max_secs: f64,
    /// Multiplier applied to the reconnect wait after each failure.
    pub reconnect_backoff_factor: f64,
    /// Frames larger than this are discarded at the application layer.
    pub max_message_size: usize,
    /// Connection attempts made by `send` before buffering.
    pub send_retry_attempts: u32,
    /// Delay between those attempts, in milliseconds.
    pub send_retry_delay_ms: u64,
    /// Whether the client reconnects on its own after a close.
    pub auto_reconnect: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT_SECS,
            ping_interval_secs: DEFAULT_PING_INTERVAL_SECS,
            reconnect_base_secs: DEFAULT_RECONNECT_BASE_SECS,
            reconnect_max_secs: DEFAULT_RECONNECT_MAX_SECS,
            reconnect_backoff_factor: DEFAULT_RECONNECT_BACKOFF_FACTOR,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            send_retry_attempts: DEFAULT_SEND_RETRY_ATTEMPTS,
            send_retry_delay_ms: DEFAULT_SEND_RETRY_DELAY_MS,
            auto_reconnect: true,
        }
    }
}

impl TransportConfig {
    /// Handshake wait as a [`Duration`].
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connection_timeout_secs)
    }

    /// Ping interval as a [`Duration`].
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Health-check cadence: twice the ping interval.
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs * 2)
    }

    /// Reconnect backoff base as a [`Duration`].
    #[must_use]
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_base_secs)
    }

    /// Reconnect backoff cap as a [`Duration`].
    #[must_use]
    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_max_secs)
    }

    /// Delay between send-path connection attempts.
    #[must_use]
    pub fn send_retry_delay(&self) -> Duration {
        Duration::from_millis(self.send_retry_delay_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduler
// ─────────────────────────────────────────────────────────────────────────────

/// Default resident worker count.
pub const DEFAULT_CORE_WORKERS: usize = 20;
/// Default worker-count ceiling.
pub const DEFAULT_MAX_WORKERS: usize = 50;
/// Default concurrent handler invocations per worker.
pub const DEFAULT_MAX_TASKS_PER_WORKER: usize = 10;
/// Default per-worker queue capacity.
pub const DEFAULT_WORKER_QUEUE_SIZE: usize = 5000;
/// Default submit retries before a message counts as rejected.
pub const DEFAULT_MAX_SUBMIT_RETRIES: u32 = 3;
/// Default bounded queue-put wait in seconds.
pub const DEFAULT_QUEUE_TIMEOUT_SECS: u64 = 5;

/// Configuration for the handler-pool scheduler.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct SchedulerConfig {
    /// Resident worker count.
    pub core_workers: usize,
    /// Worker-count ceiling.
    pub max_workers: usize,
    /// Concurrent handler invocations allowed per worker.
    pub max_tasks_per_worker: usize,
    /// Per-worker queue capacity.
    pub worker_queue_size: usize,
    /// Submit retries before a message counts as rejected.
    pub max_submit_retries: u32,
    /// Bounded queue-put wait, in seconds.
    pub queue_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            core_workers: DEFAULT_CORE_WORKERS,
            max_workers: DEFAULT_MAX_WORKERS,
            max_tasks_per_worker: DEFAULT_MAX_TASKS_PER_WORKER,
            worker_queue_size: DEFAULT_WORKER_QUEUE_SIZE,
            max_submit_retries: DEFAULT_MAX_SUBMIT_RETRIES,
            queue_timeout_secs: DEFAULT_QUEUE_TIMEOUT_SECS,
        }
    }
}

impl SchedulerConfig {
    /// Bounded queue-put wait as a [`Duration`].
    #[must_use]
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────────────────────────────────────

/// Default dispatch queue capacity.
pub const DEFAULT_DISPATCH_QUEUE_SIZE: usize = 10_000;
/// Default per-handler timeout in seconds.
pub const DEFAULT_HANDLER_TIMEOUT_SECS: u64 = 600;

/// Configuration for the inbound dispatch pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct DispatchConfig {
    /// Capacity of the queue between the transport and the dispatcher.
    pub dispatch_queue_size: usize,
    /// Per-handler invocation timeout, in seconds.
    pub handler_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            dispatch_queue_size: DEFAULT_DISPATCH_QUEUE_SIZE,
            handler_timeout_secs: DEFAULT_HANDLER_TIMEOUT_SECS,
        }
    }
}

impl DispatchConfig {
    /// Per-handler timeout as a [`Duration`].
    #[must_use]
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
