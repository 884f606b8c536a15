//! # acp-runtime
//!
//! The top-level AgentCP identity runtime. A hosting process constructs one
//! [`Agent`] per identity, registers message handlers, and calls
//! [`Agent::online`]; inbound frames then flow from the transports through
//! the session manager into the bounded dispatch queue and on to user
//! handlers via the worker-pool scheduler.
//!
//! ```ignore
//! let agent = Agent::new("a.corp.example", "./app", "./certs", "seed",
//!                        "https://auth.corp.example")?;
//! agent.add_message_handler(handler, "", "");
//! agent.online().await?;
//! let session = agent.create_session("team", "", "public").await?;
//! agent.send_message_content(&session, &["b.corp.example".into()], "hello").await?;
//! ```

mod agent;
pub mod handlers;
mod pipeline;
pub mod telemetry;

pub use agent::Agent;
pub use handlers::{HandlerFuture, HandlerRegistry, InboundMessage, MessageHandler, Selection};
pub use telemetry::init_tracing;
