//! # acp-wire
//!
//! Wire formats spoken by the AgentCP servers:
//!
//! - [`heartbeat`]: fixed-layout UDP records for the heartbeat channel
//! - [`frame`]: the 16-byte binary header framing stream chunks
//! - [`commands`]: JSON command payloads carried over the message WebSocket
//!
//! Every codec here is a byte-exact (or value-exact for JSON) round trip;
//! the tests pin that law.

pub mod commands;
pub mod frame;
pub mod heartbeat;

use thiserror::Error;

/// Codec error for the fixed-layout formats.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Datagram or frame shorter than its fixed prelude.
    #[error("truncated input: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes required.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// Record type not known to this client.
    #[error("unknown message type {0}")]
    UnknownType(u16),

    /// Magic bytes or version did not match.
    #[error("bad magic or version")]
    BadMagic,

    /// Embedded string was not valid UTF-8.
    #[error("invalid utf-8 in field {0}")]
    InvalidUtf8(&'static str),
}
