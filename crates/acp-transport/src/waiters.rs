//! Stream-creation waiter registry.
//!
//! A `session_create_stream_req` registers a waiter under its request id;
//! the matching ack (or a disconnect/timeout sentinel) is pushed onto the
//! waiter's channel. Waiters are drained as a group when the connection
//! drops so callers fail fast instead of running into their own timeouts.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use acp_core::blocks::unix_millis;

/// What a waiter receives.
#[derive(Clone, Debug)]
pub enum StreamSignal {
    /// The server's `session_create_stream_ack` payload.
    Ack(Value),
    /// The connection dropped before the ack arrived.
    ConnectionLost {
        /// Human-readable reason.
        message: String,
    },
    /// The stale-request cleaner gave up on the entry.
    Timeout {
        /// Human-readable reason.
        message: String,
    },
}

struct WaiterEntry {
    tx: mpsc::Sender<StreamSignal>,
    created_ms: u64,
    receiver: String,
}

/// Registry of outstanding stream-creation requests.
#[derive(Default)]
pub struct StreamWaiters {
    entries: Mutex<HashMap<String, WaiterEntry>>,
}

impl StreamWaiters {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter, returning the receiving half.
    pub fn register(&self, request_id: &str, receiver: &str) -> mpsc::Receiver<StreamSignal> {
        let (tx, rx) = mpsc::channel(4);
        let entry = WaiterEntry {
            tx,
            created_ms: unix_millis(),
            receiver: receiver.to_owned(),
        };
        let _ = self.entries.lock().insert(request_id.to_owned(), entry);
        rx
    }

    /// Remove a waiter; returns whether it existed.
    pub fn unregister(&self, request_id: &str) -> bool {
        self.entries.lock().remove(request_id).is_some()
    }

    /// Deliver a signal to one waiter. Returns false if unknown.
    pub fn signal(&self, request_id: &str, signal: StreamSignal) -> bool {
        let tx = {
            let entries = self.entries.lock();
            entries.get(request_id).map(|e| e.tx.clone())
        };
        match tx {
            Some(tx) => {
                if tx.try_send(signal).is_err() {
                    debug!(request_id, "stream waiter channel full or closed");
                }
                true
            }
            None => false,
        }
    }

    /// Drain every waiter with a connection-lost sentinel.
    pub fn notify_all(&self, reason: &str) {
        let drained: Vec<(String, WaiterEntry)> = self.entries.lock().drain().collect();
        if drained.is_empty() {
            return;
        }
        warn!(
            pending = drained.len(),
            reason, "notifying waiting stream requests of connection loss"
        );
        for (request_id, entry) in drained {
            let signal = StreamSignal::ConnectionLost {
                message: format!("connection lost: {reason}"),
            };
            if entry.tx.try_send(signal).is_err() {
                debug!(request_id, receiver = %entry.receiver, "waiter already gone");
            }
        }
    }

    /// Drop entries older than `max_age_ms`, signalling each with a timeout
    /// sentinel. Returns how many were dropped.
    pub fn drop_stale(&self, max_age_ms: u64) -> usize {
        let now = unix_millis();
        let stale: Vec<(String, WaiterEntry)> = {
            let mut entries = self.entries.lock();
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, e)| now.saturating_sub(e.created_ms) > max_age_ms)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e)))
                .collect()
        };
        for (request_id, entry) in &stale {
            warn!(
                request_id,
                receiver = %entry.receiver,
                age_ms = now.saturating_sub(entry.created_ms),
                "dropping stale stream request"
            );
            let _ = entry.tx.try_send(StreamSignal::Timeout {
                message: "stream creation timed out".to_owned(),
            });
        }
        stale.len()
    }

    /// Outstanding waiter count.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.entries.lock().len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn register_signal_receive() {
        let waiters = StreamWaiters::new();
        let mut rx = waiters.register("r1", "b.corp.example");
        assert_eq!(waiters.pending_count(), 1);

        let payload = serde_json::json!({"push_url": "wss://x"});
        assert!(waiters.signal("r1", StreamSignal::Ack(payload.clone())));
        assert_matches!(rx.recv().await, Some(StreamSignal::Ack(v)) if v == payload);
    }

    #[test]
    fn signal_unknown_request_returns_false() {
        let waiters = StreamWaiters::new();
        assert!(!waiters.signal("nope", StreamSignal::Ack(Value::Null)));
    }

    #[test]
    fn unregister_removes() {
        let waiters = StreamWaiters::new();
        let _rx = waiters.register("r1", "b");
        assert!(waiters.unregister("r1"));
        assert!(!waiters.unregister("r1"));
        assert_eq!(waiters.pending_count(), 0);
    }

    #[tokio::test]
    async fn notify_all_drains_and_signals() {
        let waiters = StreamWaiters::new();
        let mut rx1 = waiters.register("r1", "b");
        let mut rx2 = waiters.register("r2", "c");

        waiters.notify_all("socket closed");
        assert_eq!(waiters.pending_count(), 0);

        assert_matches!(
            rx1.recv().await,
            Some(StreamSignal::ConnectionLost { message }) if message.contains("socket closed")
        );
        assert_matches!(rx2.recv().await, Some(StreamSignal::ConnectionLost { .. }));
    }

    #[tokio::test]
    async fn drop_stale_only_old_entries() {
        let waiters = StreamWaiters::new();
        let mut old_rx = waiters.register("old", "b");
        // Backdate the entry.
        waiters.entries.lock().get_mut("old").unwrap().created_ms -= 20_000;
        let _fresh_rx = waiters.register("fresh", "c");

        let dropped = waiters.drop_stale(15_000);
        assert_eq!(dropped, 1);
        assert_eq!(waiters.pending_count(), 1);
        assert_matches!(old_rx.recv().await, Some(StreamSignal::Timeout { .. }));
    }

    #[tokio::test]
    async fn waiter_channel_bounded_but_tolerant() {
        let waiters = StreamWaiters::new();
        let mut rx = waiters.register("r1", "b");
        for _ in 0..8 {
            // Extra signals beyond the channel bound are dropped, not fatal.
            let _ = waiters.signal("r1", StreamSignal::Ack(Value::Null));
        }
        assert_matches!(rx.recv().await, Some(StreamSignal::Ack(_)));
    }
}
