//! User message handlers and their three registries.
//!
//! Handlers are registered in three scopes with strict precedence:
//! a session-scoped handler (exclusive) wins over an instruction-command
//! handler (exclusive), which wins over the global list (all run
//! concurrently). At most one scope fires per message.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;

use acp_core::blocks::{Block, InstructionBlock};
use acp_core::errors::AcpError;
use acp_wire::commands::SessionMessage;

/// One inbound message as handed to user handlers.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    /// The wire payload; `message` is still URL-encoded.
    pub raw: SessionMessage,
    /// Decoded content blocks.
    pub blocks: Arc<Vec<Block>>,
    /// Decoded router instruction, if any.
    pub instruction: Option<InstructionBlock>,
    /// Whether the first block points at a sub-stream.
    pub is_stream_message: bool,
}

impl InboundMessage {
    /// The session this message belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.raw.session_id
    }

    /// The sending identity.
    #[must_use]
    pub fn sender(&self) -> &str {
        &self.raw.sender
    }

    /// Text of the first `content` block, if present.
    #[must_use]
    pub fn first_content(&self) -> Option<&str> {
        self.blocks.iter().find_map(|block| match block {
            Block::Content { content, .. } => Some(content.as_str()),
            _ => None,
        })
    }
}

/// Future returned by a handler invocation.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), AcpError>> + Send>>;

/// A user message handler.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) -> HandlerFuture + Send + Sync>;

/// Which handlers run for a given message.
pub enum Selection {
    /// The session-scoped handler (exclusive).
    Session(MessageHandler),
    /// The instruction-command handler (exclusive).
    Command(MessageHandler),
    /// Every global handler, run concurrently.
    Global(Vec<MessageHandler>),
}

impl Selection {
    /// How many handlers this selection will invoke.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Session(_) | Self::Command(_) => 1,
            Self::Global(handlers) => handlers.len(),
        }
    }

    /// Whether nothing will run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The three handler scopes.
#[derive(Default)]
pub struct HandlerRegistry {
    global: Mutex<Vec<MessageHandler>>,
    by_session: Mutex<HashMap<String, MessageHandler>>,
    by_command: Mutex<HashMap<String, MessageHandler>>,
}

impl HandlerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the global ordered list.
    pub fn add_global(&self, handler: MessageHandler) {
        self.global.lock().push(handler);
    }

    /// Remove a global handler by identity.
    pub fn remove_global(&self, handler: &MessageHandler) {
        self.global.lock().retain(|h| !Arc::ptr_eq(h, handler));
    }

    /// Bind the exclusive handler for one session.
    pub fn set_session_handler(&self, session_id: &str, handler: MessageHandler) {
        let _ = self
            .by_session
            .lock()
            .insert(session_id.to_owned(), handler);
    }

    /// Unbind a session handler; returns whether one existed.
    pub fn remove_session_handler(&self, session_id: &str) -> bool {
        self.by_session.lock().remove(session_id).is_some()
    }

    /// Bind the exclusive handler for one instruction command.
    pub fn set_command_handler(&self, command: &str, handler: MessageHandler) {
        let _ = self.by_command.lock().insert(command.to_owned(), handler);
    }

    /// Unbind a command handler; returns whether one existed.
    pub fn remove_command_handler(&self, command: &str) -> bool {
        self.by_command.lock().remove(command).is_some()
    }

    /// Registered handler counts: (global, session, command).
    #[must_use]
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.global.lock().len(),
            self.by_session.lock().len(),
            self.by_command.lock().len(),
        )
    }

    /// Drop the scoped maps, keeping the global list (used by reset).
    pub fn clear_scoped(&self) {
        self.by_session.lock().clear();
        self.by_command.lock().clear();
    }

    /// Pick the handlers for a message per the precedence rule.
    #[must_use]
    pub fn select(&self, session_id: &str, command: Option<&str>) -> Selection {
        if let Some(handler) = self.by_session.lock().get(session_id) {
            return Selection::Session(handler.clone());
        }
        if let Some(command) = command {
            if let Some(handler) = self.by_command.lock().get(command) {
                return Selection::Command(handler.clone());
            }
        }
        Selection::Global(self.global.lock().clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn noop() -> MessageHandler {
        Arc::new(|_| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn empty_registry_selects_empty_global() {
        let registry = HandlerRegistry::new();
        let selection = registry.select("s1", None);
        assert_matches!(&selection, Selection::Global(handlers) if handlers.is_empty());
        assert!(selection.is_empty());
    }

    #[test]
    fn session_scope_wins_over_everything() {
        let registry = HandlerRegistry::new();
        registry.add_global(noop());
        registry.set_command_handler("cmd", noop());
        registry.set_session_handler("s1", noop());

        assert_matches!(registry.select("s1", Some("cmd")), Selection::Session(_));
        // Other sessions fall through to the command scope.
        assert_matches!(registry.select("s2", Some("cmd")), Selection::Command(_));
        // No command match → global.
        assert_matches!(
            registry.select("s2", Some("other")),
            Selection::Global(handlers) if handlers.len() == 1
        );
        assert_matches!(registry.select("s2", None), Selection::Global(_));
    }

    #[test]
    fn global_handlers_keep_registration_order() {
        let registry = HandlerRegistry::new();
        let first = noop();
        let second = noop();
        registry.add_global(first.clone());
        registry.add_global(second.clone());

        let Selection::Global(handlers) = registry.select("s", None) else {
            panic!("expected global selection");
        };
        assert_eq!(handlers.len(), 2);
        assert!(Arc::ptr_eq(&handlers[0], &first));
        assert!(Arc::ptr_eq(&handlers[1], &second));
    }

    #[test]
    fn remove_global_by_identity() {
        let registry = HandlerRegistry::new();
        let keep = noop();
        let drop_me = noop();
        registry.add_global(keep.clone());
        registry.add_global(drop_me.clone());

        registry.remove_global(&drop_me);
        let (global, _, _) = registry.counts();
        assert_eq!(global, 1);
    }

    #[test]
    fn scoped_handlers_can_be_removed() {
        let registry = HandlerRegistry::new();
        registry.set_session_handler("s1", noop());
        registry.set_command_handler("cmd", noop());

        assert!(registry.remove_session_handler("s1"));
        assert!(!registry.remove_session_handler("s1"));
        assert!(registry.remove_command_handler("cmd"));
        assert_matches!(registry.select("s1", Some("cmd")), Selection::Global(_));
    }

    #[test]
    fn clear_scoped_keeps_global() {
        let registry = HandlerRegistry::new();
        registry.add_global(noop());
        registry.set_session_handler("s1", noop());
        registry.set_command_handler("cmd", noop());

        registry.clear_scoped();
        let (global, session, command) = registry.counts();
        assert_eq!((global, session, command), (1, 0, 0));
    }

    #[test]
    fn inbound_message_accessors() {
        let msg = InboundMessage {
            raw: SessionMessage {
                message_id: "m1".into(),
                session_id: "s1".into(),
                ref_msg_id: String::new(),
                sender: "b.corp.example".into(),
                receiver: "a.corp.example".into(),
                message: String::new(),
                timestamp: "0".into(),
                instruction: None,
            },
            blocks: Arc::new(vec![Block::content("hi")]),
            instruction: None,
            is_stream_message: false,
        };
        assert_eq!(msg.session_id(), "s1");
        assert_eq!(msg.sender(), "b.corp.example");
        assert_eq!(msg.first_content(), Some("hi"));
    }
}
