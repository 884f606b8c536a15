//! # acp-transport
//!
//! WebSocket transports for the AgentCP runtime:
//!
//! - [`MessageClient`]: the full-duplex session channel to one message
//!   server, with connection-id-guarded lifecycle, bounded outbound
//!   buffering, health watchdog, stale-request cleanup, and
//!   exponential-backoff reconnection
//! - [`StreamClient`]: the secondary push socket opened per outbound stream
//! - [`StreamWaiters`]: the request-id → waiter registry that hands
//!   stream-creation acks back to their callers

pub mod client;
pub mod state;
pub mod stream_client;
pub mod waiters;

pub use client::{
    DisconnectCallback, MessageCallback, MessageClient, OpenCallback, ReconnectCallback,
    build_ws_url,
};
pub use state::{ConnState, ConnectionInfo};
pub use stream_client::{PendingChunk, StreamClient};
pub use waiters::{StreamSignal, StreamWaiters};
