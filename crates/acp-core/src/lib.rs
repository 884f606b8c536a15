//! # acp-core
//!
//! Foundation crate for the AgentCP client runtime:
//!
//! - [`AgentId`]: three-label peer identifier and its authority
//! - [`Block`]: the tagged message-content variant plus the URL-encoded
//!   envelope codec used on the session wire
//! - [`errors`]: structured error hierarchy shared by every subsystem
//! - [`retry`]: backoff calculation used by transports and the dispatcher
//! - [`paths`]: per-identity filesystem layout and passphrase derivation
//! - [`config`]: runtime configuration types with serde defaults

pub mod blocks;
pub mod config;
pub mod errors;
pub mod ids;
pub mod paths;
pub mod retry;

pub use blocks::{Block, InstructionBlock, decode_envelope, encode_envelope, unix_millis};
pub use errors::{AcpError, Result};
pub use ids::AgentId;
