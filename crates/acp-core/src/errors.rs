//! Error hierarchy for the AgentCP client runtime.
//!
//! Built on [`thiserror`]:
//!
//! - [`AcpError`]: top-level enum covering all error domains
//! - [`AuthError`]: sign-in / certificate-chain failures
//! - [`TransportError`]: WebSocket and UDP transport failures
//! - [`SessionError`]: session lifecycle failures
//! - [`PersistenceError`]: local store failures with table context
//! - [`SchedulerError`]: handler-pool submission failures
//!
//! Every variant carries a machine-readable `code` and a severity used by
//! retry decisions: transient errors are handled locally with backoff,
//! fatal ones surface to the host application.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, AcpError>;

/// Severity classification for logging and retry decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Recoverable; local retry with backoff is appropriate.
    Transient,
    /// Operation failed; the identity remains usable.
    Error,
    /// The identity cannot proceed (bad credentials, bad chain).
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Error => write!(f, "error"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AcpError — top-level enum
// ─────────────────────────────────────────────────────────────────────────────

/// Top-level error type for the AgentCP runtime.
#[derive(Debug, Error)]
pub enum AcpError {
    /// Sign-in / certificate failure.
    #[error("{0}")]
    Auth(#[from] AuthError),

    /// Transport failure.
    #[error("{0}")]
    Transport(#[from] TransportError),

    /// Session lifecycle failure.
    #[error("{0}")]
    Session(#[from] SessionError),

    /// Local store failure.
    #[error("{0}")]
    Persistence(#[from] PersistenceError),

    /// Scheduler rejection.
    #[error("{0}")]
    Scheduler(#[from] SchedulerError),

    /// Malformed agent identifier.
    #[error("[INVALID_AGENT_ID] not a three-label identifier: {id}")]
    InvalidAgentId {
        /// The rejected input.
        id: String,
    },

    /// Generic internal error.
    #[error("[{code}] {message}")]
    Internal {
        /// Machine-readable error code.
        code: String,
        /// Human-readable message.
        message: String,
        /// Severity.
        severity: Severity,
    },
}

impl AcpError {
    /// Create an internal error with a code and message.
    #[must_use]
    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Internal {
            code: code.into(),
            message: message.into(),
            severity: Severity::Error,
        }
    }

    /// Shorthand for the malformed-identifier case.
    #[must_use]
    pub fn invalid_agent_id(id: impl Into<String>) -> Self {
        Self::InvalidAgentId { id: id.into() }
    }

    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Auth(e) => &e.code,
            Self::Transport(e) => &e.code,
            Self::Session(e) => &e.code,
            Self::Persistence(e) => &e.code,
            Self::Scheduler(e) => &e.code,
            Self::InvalidAgentId { .. } => "INVALID_AGENT_ID",
            Self::Internal { code, .. } => code,
        }
    }

    /// Severity of this error.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::Auth(e) => e.severity,
            Self::Transport(e) => e.severity,
            Self::Session(e) => e.severity,
            Self::Persistence(_) => Severity::Error,
            Self::Scheduler(_) => Severity::Transient,
            Self::InvalidAgentId { .. } => Severity::Fatal,
            Self::Internal { severity, .. } => *severity,
        }
    }

    /// Whether local retry with backoff is appropriate.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.severity() == Severity::Transient
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AuthError
// ─────────────────────────────────────────────────────────────────────────────

/// Sign-in and certificate-chain errors.
#[derive(Debug, Error)]
#[error("[{code}] auth failed for {agent_id}: {message}")]
pub struct AuthError {
    /// Identity being signed in.
    pub agent_id: String,
    /// Human-readable message.
    pub message: String,
    /// Machine-readable error code.
    pub code: String,
    /// Severity; network failures are transient, chain failures fatal.
    pub severity: Severity,
    /// Original cause.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AuthError {
    /// Retryable network-class failure.
    #[must_use]
    pub fn network(agent_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            message: message.into(),
            code: "AUTH_NETWORK_ERROR".to_owned(),
            severity: Severity::Transient,
            source: None,
        }
    }

    /// Fatal bad-server-signature or bad-chain failure.
    #[must_use]
    pub fn bad_chain(agent_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            message: message.into(),
            code: "AUTH_CHAIN_ERROR".to_owned(),
            severity: Severity::Fatal,
            source: None,
        }
    }

    /// Fatal bad-credentials failure (key cannot be loaded or used).
    #[must_use]
    pub fn bad_credentials(agent_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            message: message.into(),
            code: "AUTH_CREDENTIALS_ERROR".to_owned(),
            severity: Severity::Fatal,
            source: None,
        }
    }

    /// Exhausted sign-in retries.
    #[must_use]
    pub fn retries_exhausted(agent_id: impl Into<String>, attempts: u32) -> Self {
        Self {
            agent_id: agent_id.into(),
            message: format!("sign-in failed after {attempts} retries"),
            code: "AUTH_RETRIES_EXHAUSTED".to_owned(),
            severity: Severity::Fatal,
            source: None,
        }
    }

    /// Attach the original cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TransportError
// ─────────────────────────────────────────────────────────────────────────────

/// WebSocket / UDP transport errors.
#[derive(Debug, Error)]
#[error("[{code}] transport error: {message}")]
pub struct TransportError {
    /// Human-readable message.
    pub message: String,
    /// Machine-readable error code.
    pub code: String,
    /// Severity.
    pub severity: Severity,
    /// WebSocket close code when applicable.
    pub close_code: Option<u16>,
    /// Original cause.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TransportError {
    /// Generic transient connection failure.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: "TRANSPORT_CONNECTION_ERROR".to_owned(),
            severity: Severity::Transient,
            close_code: None,
            source: None,
        }
    }

    /// The connection is down and the message was buffered or dropped.
    #[must_use]
    pub fn not_connected() -> Self {
        Self {
            message: "not connected".to_owned(),
            code: "TRANSPORT_NOT_CONNECTED".to_owned(),
            severity: Severity::Transient,
            close_code: None,
            source: None,
        }
    }

    /// Outbound message exceeded the configured size limit.
    #[must_use]
    pub fn oversized(size: usize, limit: usize) -> Self {
        Self {
            message: format!("message of {size} bytes exceeds limit of {limit} bytes"),
            code: "TRANSPORT_OVERSIZED".to_owned(),
            severity: Severity::Error,
            close_code: None,
            source: None,
        }
    }

    /// A bounded wait elapsed.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: "TRANSPORT_TIMEOUT".to_owned(),
            severity: Severity::Transient,
            close_code: None,
            source: None,
        }
    }

    /// Record the WebSocket close code.
    #[must_use]
    pub fn with_close_code(mut self, code: u16) -> Self {
        self.close_code = Some(code);
        self
    }

    /// Attach the original cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SessionError
// ─────────────────────────────────────────────────────────────────────────────

/// Session lifecycle operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOperation {
    /// Creating a new session.
    Create,
    /// Joining on invite or rejoining as owner.
    Join,
    /// Inviting a member.
    Invite,
    /// Sending a message.
    Send,
    /// Creating a sub-stream.
    CreateStream,
    /// Leaving or closing.
    Close,
}

impl fmt::Display for SessionOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Join => write!(f, "join"),
            Self::Invite => write!(f, "invite"),
            Self::Send => write!(f, "send"),
            Self::CreateStream => write!(f, "create_stream"),
            Self::Close => write!(f, "close"),
        }
    }
}

/// Session lifecycle error.
#[derive(Debug, Error)]
#[error("session {operation} failed for {session_id}: {message}")]
pub struct SessionError {
    /// Session the operation targeted.
    pub session_id: String,
    /// Operation that failed.
    pub operation: SessionOperation,
    /// Human-readable message.
    pub message: String,
    /// Machine-readable error code.
    pub code: String,
    /// Severity.
    pub severity: Severity,
}

impl SessionError {
    /// Create a new session error.
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        operation: SessionOperation,
        message: impl Into<String>,
    ) -> Self {
        let op_upper = operation.to_string().to_uppercase();
        Self {
            session_id: session_id.into(),
            operation,
            message: message.into(),
            code: format!("SESSION_{op_upper}_ERROR"),
            severity: Severity::Error,
        }
    }

    /// Mark as transient (retryable by the caller).
    #[must_use]
    pub fn transient(mut self) -> Self {
        self.severity = Severity::Transient;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PersistenceError
// ─────────────────────────────────────────────────────────────────────────────

/// Local store error with table context.
#[derive(Debug, Error)]
#[error("[{code}] store {operation} failed on {table}: {message}")]
pub struct PersistenceError {
    /// Table that failed.
    pub table: String,
    /// Operation name (`insert`, `update`, `query`, ...).
    pub operation: String,
    /// Human-readable message.
    pub message: String,
    /// Machine-readable error code.
    pub code: String,
    /// Original cause.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl PersistenceError {
    /// Create a new persistence error.
    #[must_use]
    pub fn new(
        table: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let operation = operation.into();
        let op_upper = operation.to_uppercase();
        Self {
            table: table.into(),
            operation,
            message: message.into(),
            code: format!("STORE_{op_upper}_ERROR"),
            source: None,
        }
    }

    /// Attach the original cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SchedulerError
// ─────────────────────────────────────────────────────────────────────────────

/// Handler-pool submission error.
#[derive(Debug, Error)]
#[error("[{code}] scheduler rejected submission: {message}")]
pub struct SchedulerError {
    /// Human-readable message.
    pub message: String,
    /// Machine-readable error code.
    pub code: String,
}

impl SchedulerError {
    /// All candidate workers refused the task.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: "SCHEDULER_REJECTED".to_owned(),
        }
    }

    /// The pool is shut down.
    #[must_use]
    pub fn shutdown() -> Self {
        Self {
            message: "scheduler is shut down".to_owned(),
            code: "SCHEDULER_SHUTDOWN".to_owned(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_network_is_transient() {
        let err = AcpError::from(AuthError::network("a.corp.example", "timeout"));
        assert_eq!(err.code(), "AUTH_NETWORK_ERROR");
        assert!(err.is_retryable());
    }

    #[test]
    fn auth_chain_is_fatal() {
        let err = AcpError::from(AuthError::bad_chain("a.corp.example", "bad issuer"));
        assert_eq!(err.severity(), Severity::Fatal);
        assert!(!err.is_retryable());
    }

    #[test]
    fn auth_retries_exhausted_message() {
        let err = AuthError::retries_exhausted("a.corp.example", 10);
        assert!(err.to_string().contains("10 retries"));
        assert_eq!(err.code, "AUTH_RETRIES_EXHAUSTED");
    }

    #[test]
    fn transport_oversized_carries_sizes() {
        let err = TransportError::oversized(11 * 1024 * 1024, 10 * 1024 * 1024);
        assert_eq!(err.code, "TRANSPORT_OVERSIZED");
        assert!(err.to_string().contains("exceeds limit"));
    }

    #[test]
    fn transport_close_code() {
        let err = TransportError::connection("closed").with_close_code(1006);
        assert_eq!(err.close_code, Some(1006));
        assert!(AcpError::from(err).is_retryable());
    }

    #[test]
    fn session_error_code_from_operation() {
        let err = SessionError::new("s1", SessionOperation::CreateStream, "timeout");
        assert_eq!(err.code, "SESSION_CREATE_STREAM_ERROR");
        assert!(err.to_string().contains("s1"));
    }

    #[test]
    fn session_transient_builder() {
        let err = SessionError::new("s1", SessionOperation::Send, "buffered").transient();
        assert!(AcpError::from(err).is_retryable());
    }

    #[test]
    fn persistence_error_table_context() {
        let err = PersistenceError::new("messages_ab12", "insert", "disk full");
        assert_eq!(err.code, "STORE_INSERT_ERROR");
        assert!(err.to_string().contains("messages_ab12"));
    }

    #[test]
    fn scheduler_rejected() {
        let err = AcpError::from(SchedulerError::rejected("all workers full"));
        assert_eq!(err.code(), "SCHEDULER_REJECTED");
        assert!(err.is_retryable());
    }

    #[test]
    fn invalid_agent_id_fatal() {
        let err = AcpError::invalid_agent_id("nope");
        assert_eq!(err.code(), "INVALID_AGENT_ID");
        assert_eq!(err.severity(), Severity::Fatal);
    }

    #[test]
    fn internal_error_display() {
        let err = AcpError::internal("MY_CODE", "boom");
        assert_eq!(err.to_string(), "[MY_CODE] boom");
    }

    #[test]
    fn errors_are_std_error() {
        let err = AcpError::internal("C", "m");
        let _: &dyn std::error::Error = &err;
    }

    #[test]
    fn with_source_preserved() {
        let cause = std::io::Error::other("socket reset");
        let err = TransportError::connection("send failed").with_source(cause);
        assert!(err.source.is_some());
    }
}
