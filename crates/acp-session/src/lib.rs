//! # acp-session
//!
//! Session lifecycle and the per-identity session registry:
//!
//! - [`Session`]: one multi-party conversation, covering owner creation,
//!   invite accept, rejoin on reconnect, message send, and sub-streams
//! - [`SessionManager`]: the registry of sessions and message transports,
//!   and the single ingress point routing inbound WebSocket frames

pub mod manager;
pub mod session;

pub use manager::{
    InviteAckCallback, MessageAckCallback, SessionManager, SessionMessageCallback,
    SystemMessageCallback,
};
pub use session::Session;
