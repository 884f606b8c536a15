//! Connection state machine types.

use std::fmt;

/// Lifecycle state of a message transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// No socket; nothing in flight.
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// The socket is open and verified.
    Connected,
    /// The reconnect worker is between attempts.
    Reconnecting,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Point-in-time connection diagnostics.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    /// Identity the transport belongs to.
    pub agent_id: String,
    /// Message server root URL.
    pub server_url: String,
    /// Current state.
    pub state: ConnState,
    /// Whether the underlying socket is open.
    pub ws_open: bool,
    /// Whether the reconnect worker is active.
    pub is_retrying: bool,
    /// Attempts made by the current reconnect episode.
    pub reconnect_attempts: u32,
    /// Current connection id.
    pub connection_id: u64,
    /// Buffered outbound messages.
    pub queue_size: usize,
    /// Outbound buffer capacity.
    pub queue_capacity: usize,
    /// Outstanding stream-creation requests.
    pub pending_streams: usize,
}

impl ConnectionInfo {
    /// A transport is healthy when connected with an open socket and no
    /// reconnect in flight.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.ws_open && self.state == ConnState::Connected && !self.is_retrying
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
