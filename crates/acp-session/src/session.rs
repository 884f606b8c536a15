//! State and operations for one multi-party session.
//!
//! A session is *owned* when its identifying code is set (this identity
//! created it) and *joined* otherwise (it holds the invite used to enter).
//! When the underlying transport reopens, an owner rejoins with its own
//! code and a member re-accepts its stored invite. The session also tracks
//! the push-side stream clients it has opened, keyed by push URL.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use acp_core::blocks::{Block, InstructionBlock, encode_envelope, unix_millis};
use acp_core::errors::{AcpError, SessionError, SessionOperation};
use acp_transport::{MessageClient, StreamClient, StreamSignal};
use acp_wire::commands::{
    CMD_CLOSE_SESSION_REQ, CMD_EJECT_AGENT_REQ, CMD_GET_MEMBER_LIST, CMD_INVITE_AGENT_REQ,
    CMD_JOIN_SESSION_REQ, CMD_LEAVE_SESSION_REQ, CMD_SESSION_CREATE_STREAM_REQ,
    CMD_SESSION_MESSAGE, CloseSessionReq, EjectAgentReq, GetMemberListReq, InviteAgentReq,
    JoinSessionReq, LeaveSessionReq, SessionCreateStreamAck, SessionCreateStreamReq,
    SessionMessage, WsFrame,
};
use acp_wire::heartbeat::InviteRequest;

/// Bounded wait for one stream-creation ack.
const STREAM_ACK_TIMEOUT: Duration = Duration::from_secs(10);
/// Extra attempts made by the public `create_stream`.
const STREAM_MAX_RETRIES: u32 = 2;
/// Wait for the transport to come back between those attempts.
const STREAM_RECONNECT_WAIT: Duration = Duration::from_secs(10);

fn now_ms_string() -> String {
    unix_millis().to_string()
}

enum StreamAttempt {
    Success(String, String),
    ConnectionLost(String),
    Failed(AcpError),
}

/// One logical multi-party conversation.
pub struct Session {
    agent_id: String,
    session_id: String,
    identifying_code: Mutex<String>,
    invite: Mutex<Option<InviteRequest>>,
    client: Weak<MessageClient>,
    streams: Mutex<HashMap<String, Arc<StreamClient>>>,
}

impl Session {
    /// A session this identity created; `identifying_code` is the owner
    /// secret from the create ack.
    #[must_use]
    pub fn owned(
        agent_id: &str,
        session_id: &str,
        identifying_code: &str,
        client: &Arc<MessageClient>,
    ) -> Self {
        Self {
            agent_id: agent_id.to_owned(),
            session_id: session_id.to_owned(),
            identifying_code: Mutex::new(identifying_code.to_owned()),
            invite: Mutex::new(None),
            client: Arc::downgrade(client),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// A session this identity joined via `invite`.
    #[must_use]
    pub fn joined(agent_id: &str, invite: InviteRequest, client: &Arc<MessageClient>) -> Self {
        Self {
            agent_id: agent_id.to_owned(),
            session_id: invite.session_id.clone(),
            identifying_code: Mutex::new(String::new()),
            invite: Mutex::new(Some(invite)),
            client: Arc::downgrade(client),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// The server-assigned session id.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether this identity owns the session (can invite and eject).
    #[must_use]
    pub fn is_owner(&self) -> bool {
        !self.identifying_code.lock().is_empty()
    }

    /// Set the owner secret (used when rebuilding from the local store).
    pub fn set_identifying_code(&self, code: &str) {
        *self.identifying_code.lock() = code.to_owned();
    }

    /// The owner secret; empty for joined sessions.
    #[must_use]
    pub fn identifying_code(&self) -> String {
        self.identifying_code.lock().clone()
    }

    /// Active outbound stream count.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    fn client(&self) -> Result<Arc<MessageClient>, AcpError> {
        self.client.upgrade().ok_or_else(|| {
            SessionError::new(&self.session_id, SessionOperation::Send, "transport gone").into()
        })
    }

    async fn send_frame(
        &self,
        operation: SessionOperation,
        frame: &WsFrame,
    ) -> Result<(), AcpError> {
        let client = self.client()?;
        client.send(&frame.to_json()).await.map_err(|e| {
            debug!(session_id = %self.session_id, %operation, error = %e, "frame send failed");
            e
        })
    }

    /// Re-establish membership after the transport reopened.
    pub async fn on_transport_open(&self) {
        let invite = self.invite.lock().clone();
        if let Some(invite) = invite {
            if let Err(e) = self.accept_invite(&invite).await {
                warn!(session_id = %self.session_id, error = %e, "re-accept after reconnect failed");
            }
        }
        if self.is_owner() {
            if let Err(e) = self.owner_rejoin().await {
                warn!(session_id = %self.session_id, error = %e, "owner rejoin failed");
            }
        }
    }

    /// Join using an invite (initial join and reconnect re-accept).
    pub async fn accept_invite(&self, invite: &InviteRequest) -> Result<(), AcpError> {
        let frame = WsFrame::new(
            CMD_JOIN_SESSION_REQ,
            &JoinSessionReq {
                session_id: invite.session_id.clone(),
                request_id: now_ms_string(),
                inviter_agent_id: invite.inviter_id.clone(),
                invite_code: invite.invite_code.clone(),
                last_msg_id: "0".to_owned(),
            },
        );
        *self.invite.lock() = Some(invite.clone());
        self.send_frame(SessionOperation::Join, &frame).await
    }

    /// Restore owner membership with the identifying code.
    pub async fn owner_rejoin(&self) -> Result<(), AcpError> {
        let code = self.identifying_code.lock().clone();
        let frame = WsFrame::new(
            CMD_JOIN_SESSION_REQ,
            &JoinSessionReq {
                session_id: self.session_id.clone(),
                request_id: now_ms_string(),
                inviter_agent_id: String::new(),
                invite_code: code,
                last_msg_id: "0".to_owned(),
            },
        );
        self.send_frame(SessionOperation::Join, &frame).await
    }

    /// Invite `acceptor` into the session (owner only).
    pub async fn invite_member(&self, acceptor: &str) -> Result<(), AcpError> {
        let code = self.identifying_code.lock().clone();
        if code.is_empty() {
            return Err(SessionError::new(
                &self.session_id,
                SessionOperation::Invite,
                "only the owner can invite",
            )
            .into());
        }
        let frame = WsFrame::new(
            CMD_INVITE_AGENT_REQ,
            &InviteAgentReq {
                session_id: self.session_id.clone(),
                request_id: Uuid::new_v4().simple().to_string(),
                inviter_id: self.agent_id.clone(),
                acceptor_id: acceptor.to_owned(),
                invite_code: code,
            },
        );
        self.send_frame(SessionOperation::Invite, &frame).await
    }

    /// Remove `member` from the session (owner only).
    pub async fn eject_member(&self, member: &str) -> Result<(), AcpError> {
        let code = self.identifying_code.lock().clone();
        if code.is_empty() {
            return Err(SessionError::new(
                &self.session_id,
                SessionOperation::Invite,
                "only the owner can eject",
            )
            .into());
        }
        let frame = WsFrame::new(
            CMD_EJECT_AGENT_REQ,
            &EjectAgentReq {
                session_id: self.session_id.clone(),
                request_id: now_ms_string(),
                eject_agent_id: member.to_owned(),
                identifying_code: code,
            },
        );
        self.send_frame(SessionOperation::Invite, &frame).await
    }

    /// Ask the server for the member list (answered asynchronously).
    pub async fn request_member_list(&self) -> Result<(), AcpError> {
        let frame = WsFrame::new(
            CMD_GET_MEMBER_LIST,
            &GetMemberListReq {
                session_id: self.session_id.clone(),
                request_id: now_ms_string(),
            },
        );
        self.send_frame(SessionOperation::Send, &frame).await
    }

    /// Send a message to `receiver` (semicolon-joined identities).
    ///
    /// The block array is JSON- then URL-encoded into the envelope; the
    /// message id defaults to the current unix-millisecond time.
    pub async fn send_msg(
        &self,
        blocks: &[Block],
        receiver: &str,
        ref_msg_id: &str,
        message_id: &str,
        instruction: Option<&InstructionBlock>,
    ) -> Result<String, AcpError> {
        if blocks.is_empty() && instruction.is_none() {
            return Err(SessionError::new(
                &self.session_id,
                SessionOperation::Send,
                "empty message",
            )
            .into());
        }
        let message_id = if message_id.is_empty() {
            now_ms_string()
        } else {
            message_id.to_owned()
        };
        let frame = WsFrame::new(
            CMD_SESSION_MESSAGE,
            &SessionMessage {
                message_id: message_id.clone(),
                session_id: self.session_id.clone(),
                ref_msg_id: ref_msg_id.to_owned(),
                sender: self.agent_id.clone(),
                receiver: receiver.to_owned(),
                message: encode_envelope(blocks),
                timestamp: now_ms_string(),
                instruction: instruction
                    .map(|i| serde_json::to_value(i).unwrap_or(serde_json::Value::Null)),
            },
        );
        self.send_frame(SessionOperation::Send, &frame).await?;
        Ok(message_id)
    }

    // ── streams ─────────────────────────────────────────────────────────────

    /// Create a sub-stream to `to_aids`.
    ///
    /// Transparently retries across a transport drop: each retry first
    /// waits (bounded) for the socket to come back. Returns the
    /// `(push_url, pull_url)` pair from the ack.
    pub async fn create_stream(
        &self,
        to_aids: &[String],
        content_type: &str,
        ref_msg_id: &str,
    ) -> Result<(String, String), AcpError> {
        let mut last_error: Option<AcpError> = None;

        for attempt in 0..=STREAM_MAX_RETRIES {
            match self.create_stream_once(to_aids, content_type, ref_msg_id).await {
                StreamAttempt::Success(push, pull) => return Ok((push, pull)),
                StreamAttempt::Failed(e) => return Err(e),
                StreamAttempt::ConnectionLost(message) => {
                    warn!(
                        session_id = %self.session_id,
                        attempt,
                        message,
                        "stream creation hit a dropped connection"
                    );
                    last_error = Some(
                        SessionError::new(
                            &self.session_id,
                            SessionOperation::CreateStream,
                            message,
                        )
                        .transient()
                        .into(),
                    );
                    if attempt < STREAM_MAX_RETRIES {
                        let client = self.client()?;
                        if client.wait_for_ready(STREAM_RECONNECT_WAIT).await {
                            info!(session_id = %self.session_id, "transport recovered, retrying stream");
                        } else {
                            warn!(session_id = %self.session_id, "transport still down, retrying anyway");
                        }
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            SessionError::new(
                &self.session_id,
                SessionOperation::CreateStream,
                "retries exhausted",
            )
            .into()
        }))
    }

    async fn create_stream_once(
        &self,
        to_aids: &[String],
        content_type: &str,
        ref_msg_id: &str,
    ) -> StreamAttempt {
        let client = match self.client() {
            Ok(client) => client,
            Err(e) => return StreamAttempt::Failed(e),
        };
        if !client.is_ws_open() || !client.is_connected() {
            return StreamAttempt::ConnectionLost("transport not connected".to_owned());
        }

        let receiver = to_aids.join(",");
        let request_id = Uuid::new_v4().simple().to_string();
        let mut rx = client.waiters().register(&request_id, &receiver);

        let frame = WsFrame::new(
            CMD_SESSION_CREATE_STREAM_REQ,
            &SessionCreateStreamReq {
                session_id: self.session_id.clone(),
                request_id: request_id.clone(),
                ref_msg_id: ref_msg_id.to_owned(),
                sender: self.agent_id.clone(),
                receiver: receiver.clone(),
                content_type: content_type.to_owned(),
                timestamp: now_ms_string(),
            },
        );
        if let Err(e) = client.send(&frame.to_json()).await {
            let _ = client.waiters().unregister(&request_id);
            return StreamAttempt::ConnectionLost(format!("stream request send failed: {e}"));
        }
        debug!(session_id = %self.session_id, request_id, receiver, "stream request sent");

        let signal = tokio::time::timeout(STREAM_ACK_TIMEOUT, rx.recv()).await;
        let _ = client.waiters().unregister(&request_id);

        let ack_value = match signal {
            Ok(Some(StreamSignal::Ack(value))) => value,
            Ok(Some(StreamSignal::ConnectionLost { message })) => {
                return StreamAttempt::ConnectionLost(message);
            }
            Ok(Some(StreamSignal::Timeout { message })) => {
                return StreamAttempt::ConnectionLost(message);
            }
            Ok(None) | Err(_) => {
                error!(
                    session_id = %self.session_id,
                    request_id,
                    pending = client.waiters().pending_count(),
                    "stream creation timed out"
                );
                return StreamAttempt::ConnectionLost("stream ack timed out".to_owned());
            }
        };

        let ack: SessionCreateStreamAck = match serde_json::from_value(ack_value) {
            Ok(ack) => ack,
            Err(e) => {
                return StreamAttempt::Failed(
                    SessionError::new(
                        &self.session_id,
                        SessionOperation::CreateStream,
                        format!("incomplete stream ack: {e}"),
                    )
                    .into(),
                );
            }
        };

        match self.open_stream_client(&client, &ack.push_url).await {
            Ok(()) => StreamAttempt::Success(ack.push_url, ack.pull_url),
            Err(e) => StreamAttempt::Failed(e),
        }
    }

    async fn open_stream_client(
        &self,
        client: &Arc<MessageClient>,
        push_url: &str,
    ) -> Result<(), AcpError> {
        let signature = client.auth().signature().unwrap_or_default();
        let stream = Arc::new(StreamClient::new(
            &self.agent_id,
            &self.session_id,
            push_url,
            &signature,
        ));
        if stream.open().await.is_err() {
            // One settle-and-retry before giving up on the push socket.
            tokio::time::sleep(Duration::from_secs(1)).await;
            stream.open().await.map_err(|e| {
                error!(session_id = %self.session_id, push_url, "stream socket open failed");
                e
            })?;
        }
        let _ = self
            .streams
            .lock()
            .insert(push_url.to_owned(), stream);
        Ok(())
    }

    /// Push one text chunk on the stream at `push_url`.
    pub async fn send_chunk(&self, push_url: &str, chunk: &str) -> Result<(), AcpError> {
        let stream = self.stream_at(push_url)?;
        stream.send_text_chunk(chunk).await
    }

    /// Push one binary file chunk; `Ok(false)` asks the caller to pace.
    pub async fn send_file_chunk(
        &self,
        push_url: &str,
        offset: u32,
        bytes: &[u8],
    ) -> Result<bool, AcpError> {
        let stream = self.stream_at(push_url)?;
        stream.send_binary_chunk(offset, bytes).await
    }

    /// Close and forget the stream at `push_url`.
    pub async fn close_stream(&self, push_url: &str) {
        let stream = self.streams.lock().remove(push_url);
        if let Some(stream) = stream {
            stream.close().await;
        }
    }

    fn stream_at(&self, push_url: &str) -> Result<Arc<StreamClient>, AcpError> {
        self.streams.lock().get(push_url).cloned().ok_or_else(|| {
            SessionError::new(
                &self.session_id,
                SessionOperation::CreateStream,
                format!("no stream for {push_url}"),
            )
            .into()
        })
    }

    /// Whether `push_url` belongs to one of this session's streams.
    #[must_use]
    pub fn has_stream(&self, push_url: &str) -> bool {
        self.streams.lock().contains_key(push_url)
    }

    /// Whether this session rides on `client`.
    #[must_use]
    pub fn is_on(&self, client: &Arc<MessageClient>) -> bool {
        self.client.ptr_eq(&Arc::downgrade(client))
    }

    /// Leave (member) or close (owner) the session and tear down streams.
    pub async fn close(&self) {
        let streams: Vec<Arc<StreamClient>> = self.streams.lock().drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.close().await;
        }

        let code = self.identifying_code.lock().clone();
        let result = if code.is_empty() {
            let frame = WsFrame::new(
                CMD_LEAVE_SESSION_REQ,
                &LeaveSessionReq {
                    session_id: self.session_id.clone(),
                    request_id: now_ms_string(),
                },
            );
            self.send_frame(SessionOperation::Close, &frame).await
        } else {
            let frame = WsFrame::new(
                CMD_CLOSE_SESSION_REQ,
                &CloseSessionReq {
                    session_id: self.session_id.clone(),
                    request_id: now_ms_string(),
                    identifying_code: code,
                },
            );
            self.send_frame(SessionOperation::Close, &frame).await
        };
        if let Err(e) = result {
            debug!(session_id = %self.session_id, error = %e, "close frame not delivered");
        }
        info!(session_id = %self.session_id, "session closed");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use acp_core::config::TransportConfig;
    use acp_core::paths::IdentityPaths;
    use acp_auth::AuthClient;

    use super::*;

    fn test_client() -> Arc<MessageClient> {
        let paths = IdentityPaths::new("/tmp/acp-sess-test", "/tmp/acp-sess-test/certs", "a.corp.example");
        let auth = Arc::new(AuthClient::new(
            "a.corp.example",
            "https://msg.corp.example",
            paths,
            "pass",
        ));
        Arc::new(MessageClient::new(
            "a.corp.example",
            "https://msg.corp.example",
            auth,
            TransportConfig::default(),
        ))
    }

    fn invite() -> InviteRequest {
        InviteRequest {
            seq: 1,
            session_id: "sess-1".into(),
            inviter_id: "b.corp.example".into(),
            invite_code: "c0de".into(),
            message_server: "https://msg.corp.example".into(),
        }
    }

    #[test]
    fn owner_and_member_roles() {
        let client = test_client();
        let owned = Session::owned("a.corp.example", "s1", "secret", &client);
        assert!(owned.is_owner());

        let joined = Session::joined("a.corp.example", invite(), &client);
        assert!(!joined.is_owner());
        assert_eq!(joined.session_id(), "sess-1");
    }

    #[test]
    fn identifying_code_can_be_restored() {
        let client = test_client();
        let session = Session::joined("a.corp.example", invite(), &client);
        assert!(!session.is_owner());
        session.set_identifying_code("restored");
        assert!(session.is_owner());
    }

    #[tokio::test]
    async fn invite_requires_ownership() {
        let client = test_client();
        let session = Session::joined("a.corp.example", invite(), &client);
        let err = session.invite_member("c.corp.example").await.unwrap_err();
        assert_eq!(err.code(), "SESSION_INVITE_ERROR");
    }

    #[tokio::test]
    async fn eject_requires_ownership() {
        let client = test_client();
        let session = Session::joined("a.corp.example", invite(), &client);
        assert!(session.eject_member("c.corp.example").await.is_err());
    }

    #[tokio::test]
    async fn empty_message_rejected() {
        let client = test_client();
        let session = Session::owned("a.corp.example", "s1", "code", &client);
        let err = session
            .send_msg(&[], "b.corp.example", "", "", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SESSION_SEND_ERROR");
    }

    #[tokio::test]
    async fn dead_transport_is_session_error() {
        let client = test_client();
        let session = Session::owned("a.corp.example", "s1", "code", &client);
        drop(client);
        let err = session
            .send_msg(&[Block::content("x")], "b.corp.example", "", "m1", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("transport gone"));
    }

    #[tokio::test]
    async fn create_stream_fails_fast_when_disconnected() {
        // Disconnected transport → every attempt reports connection lost;
        // wait_for_ready polls up to its bound, so shrink nothing: we only
        // check classification here by calling the single-attempt path.
        let client = test_client();
        let session = Session::owned("a.corp.example", "s1", "code", &client);
        let attempt = session
            .create_stream_once(&["b.corp.example".to_owned()], "text/event-stream", "")
            .await;
        assert_matches::assert_matches!(attempt, StreamAttempt::ConnectionLost(_));
    }

    #[tokio::test]
    async fn stream_chunk_without_stream_errors() {
        let client = test_client();
        let session = Session::owned("a.corp.example", "s1", "code", &client);
        let err = session.send_chunk("wss://nope", "chunk").await.unwrap_err();
        assert_eq!(err.code(), "SESSION_CREATE_STREAM_ERROR");
        assert!(!session.has_stream("wss://nope"));
    }

    #[test]
    fn message_id_defaults_to_unix_millis() {
        // The default is produced by now_ms_string; check its shape.
        let id = now_ms_string();
        assert!(id.parse::<u64>().unwrap() > 1_600_000_000_000);
    }
}
