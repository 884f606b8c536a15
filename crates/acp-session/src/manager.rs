//! Per-identity registry of sessions and message transports.
//!
//! The manager owns one `MessageClient` per distinct message-server URL
//! (sharing one `AuthClient` per server so the signature token is reused)
//! and is the single ingress point for every inbound WebSocket frame: acks
//! are routed to their waiters, session messages to the runtime's inbound
//! callback, stream acks into the owning client's waiter map. Every method
//! follows acquire → look up or mutate → release → I/O outside the lock.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use acp_auth::AuthClient;
use acp_core::blocks::{Block, InstructionBlock, unix_millis};
use acp_core::config::TransportConfig;
use acp_core::errors::{AcpError, SessionError, SessionOperation};
use acp_core::paths::IdentityPaths;
use acp_store::Store;
use acp_transport::{DisconnectCallback, MessageClient, ReconnectCallback, StreamSignal};
use acp_wire::commands::{
    CMD_CREATE_SESSION_ACK, CMD_CREATE_SESSION_REQ, CMD_INVITE_AGENT_ACK, CMD_SESSION_CREATE_STREAM_ACK,
    CMD_SESSION_MESSAGE, CMD_SESSION_MESSAGE_ACK, CMD_SYSTEM_MESSAGE, CreateSessionAck,
    CreateSessionReq, InviteAgentAck, SessionMessage, SessionMessageAck, SystemMessage, WsFrame,
};
use acp_wire::heartbeat::InviteRequest;

use crate::session::Session;

/// Bounded wait for the create-session ack.
const CREATE_SESSION_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Synchronous callback for an inbound `session_message`; must only enqueue.
pub type SessionMessageCallback = Arc<dyn Fn(SessionMessage) + Send + Sync>;
/// Synchronous callback for `invite_agent_ack`.
pub type InviteAckCallback = Arc<dyn Fn(InviteAgentAck) + Send + Sync>;
/// Synchronous callback for `session_message_ack`.
pub type MessageAckCallback = Arc<dyn Fn(SessionMessageAck) + Send + Sync>;
/// Synchronous callback for `system_message`.
pub type SystemMessageCallback = Arc<dyn Fn(SystemMessage) + Send + Sync>;

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Arc<Session>>,
    clients: HashMap<String, Arc<MessageClient>>,
    auth_cache: HashMap<String, Arc<AuthClient>>,
}

struct ManagerInner {
    agent_id: String,
    default_server: String,
    paths: IdentityPaths,
    passphrase: String,
    config: TransportConfig,
    store: Arc<Store>,
    registry: Mutex<Registry>,
    create_waiters: Mutex<HashMap<String, oneshot::Sender<CreateSessionAck>>>,
    on_session_message: Mutex<Option<SessionMessageCallback>>,
    on_invite_ack: Mutex<Option<InviteAckCallback>>,
    on_message_ack: Mutex<Option<MessageAckCallback>>,
    on_system_message: Mutex<Option<SystemMessageCallback>>,
    disconnect_cb: Mutex<Option<DisconnectCallback>>,
    reconnect_cb: Mutex<Option<ReconnectCallback>>,
}

/// Session and transport registry for one identity.
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Create a manager; transports are created lazily per server URL.
    #[must_use]
    pub fn new(
        agent_id: &str,
        default_server: &str,
        paths: IdentityPaths,
        passphrase: &str,
        config: TransportConfig,
        store: Arc<Store>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                agent_id: agent_id.to_owned(),
                default_server: default_server.trim_end_matches('/').to_owned(),
                paths,
                passphrase: passphrase.to_owned(),
                config,
                store,
                registry: Mutex::new(Registry::default()),
                create_waiters: Mutex::new(HashMap::new()),
                on_session_message: Mutex::new(None),
                on_invite_ack: Mutex::new(None),
                on_message_ack: Mutex::new(None),
                on_system_message: Mutex::new(None),
                disconnect_cb: Mutex::new(None),
                reconnect_cb: Mutex::new(None),
            }),
        }
    }

    /// Register the inbound session-message callback.
    pub fn set_on_session_message(&self, callback: SessionMessageCallback) {
        *self.inner.on_session_message.lock() = Some(callback);
    }

    /// Register the invite-ack callback.
    pub fn set_on_invite_ack(&self, callback: InviteAckCallback) {
        *self.inner.on_invite_ack.lock() = Some(callback);
    }

    /// Register the message-ack callback.
    pub fn set_on_message_ack(&self, callback: MessageAckCallback) {
        *self.inner.on_message_ack.lock() = Some(callback);
    }

    /// Register the system-message callback.
    pub fn set_on_system_message(&self, callback: SystemMessageCallback) {
        *self.inner.on_system_message.lock() = Some(callback);
    }

    /// Register the disconnect callback on every current and future client.
    pub fn set_disconnect_callback(&self, callback: DisconnectCallback) {
        *self.inner.disconnect_cb.lock() = Some(callback.clone());
        let clients = self.clients();
        for client in clients {
            client.set_disconnect_callback(callback.clone());
        }
    }

    /// Register the reconnect callback on every current and future client.
    pub fn set_reconnect_callback(&self, callback: ReconnectCallback) {
        *self.inner.reconnect_cb.lock() = Some(callback.clone());
        let clients = self.clients();
        for client in clients {
            client.set_reconnect_callback(callback.clone());
        }
    }

    /// Look up a session.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.registry.lock().sessions.get(session_id).cloned()
    }

    /// Registered session count.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.registry.lock().sessions.len()
    }

    /// The client serving `server_url`, if one exists.
    #[must_use]
    pub fn client_for(&self, server_url: &str) -> Option<Arc<MessageClient>> {
        self.inner
            .registry
            .lock()
            .clients
            .get(server_url.trim_end_matches('/'))
            .cloned()
    }

    /// Every owned transport.
    #[must_use]
    pub fn clients(&self) -> Vec<Arc<MessageClient>> {
        self.inner.registry.lock().clients.values().cloned().collect()
    }

    /// Whether `push_url` belongs to any session's active streams.
    #[must_use]
    pub fn stream_url_exists(&self, push_url: &str) -> bool {
        let sessions: Vec<Arc<Session>> =
            self.inner.registry.lock().sessions.values().cloned().collect();
        sessions.iter().any(|s| s.has_stream(push_url))
    }

    fn get_or_create_client(&self, server_url: &str) -> Arc<MessageClient> {
        get_or_create_client(&self.inner, server_url)
    }

    /// Create a session on the default message server and wait for its ack.
    pub async fn create_session(
        &self,
        name: &str,
        subject: &str,
        session_type: &str,
    ) -> Result<Arc<Session>, AcpError> {
        let server = self.inner.default_server.clone();
        let client = self.get_or_create_client(&server);
        client.start().await.map_err(|e| {
            AcpError::from(
                SessionError::new("", SessionOperation::Create, format!("transport: {e}"))
                    .transient(),
            )
        })?;

        let request_id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();
        let _ = self
            .inner
            .create_waiters
            .lock()
            .insert(request_id.clone(), tx);

        let frame = WsFrame::new(
            CMD_CREATE_SESSION_REQ,
            &CreateSessionReq {
                request_id: request_id.clone(),
                session_type: session_type.to_owned(),
                group_name: name.to_owned(),
                subject: subject.to_owned(),
                timestamp: unix_millis().to_string(),
            },
        );
        if let Err(e) = client.send(&frame.to_json()).await {
            let _ = self.inner.create_waiters.lock().remove(&request_id);
            return Err(SessionError::new("", SessionOperation::Create, e.to_string())
                .transient()
                .into());
        }

        let ack = match tokio::time::timeout(CREATE_SESSION_ACK_TIMEOUT, rx).await {
            Ok(Ok(ack)) => ack,
            _ => {
                let _ = self.inner.create_waiters.lock().remove(&request_id);
                return Err(SessionError::new("", SessionOperation::Create, "ack timed out")
                    .transient()
                    .into());
            }
        };
        if ack.status_code != 200 {
            return Err(SessionError::new(
                &ack.session_id,
                SessionOperation::Create,
                format!("server rejected: {} {}", ack.status_code, ack.message),
            )
            .into());
        }

        let session = Arc::new(Session::owned(
            &self.inner.agent_id,
            &ack.session_id,
            &ack.identifying_code,
            &client,
        ));
        let session = {
            let mut registry = self.inner.registry.lock();
            registry
                .sessions
                .entry(ack.session_id.clone())
                .or_insert(session)
                .clone()
        };
        info!(agent_id = %self.inner.agent_id, session_id = %ack.session_id, name, "session created");
        Ok(session)
    }

    /// Join a session on an invite delivered over the heartbeat channel.
    ///
    /// Double-checked: a concurrent join of the same session returns the
    /// existing registration.
    pub async fn join_session(&self, invite: InviteRequest) -> Result<Arc<Session>, AcpError> {
        if let Some(existing) = self.get(&invite.session_id) {
            return Ok(existing);
        }

        let client = self.get_or_create_client(&invite.message_server);
        if let Err(e) = client.start().await {
            // The join frame will be buffered and delivered on reconnect.
            debug!(error = %e, "transport not up yet, join will be buffered");
        }

        let session = Arc::new(Session::joined(&self.inner.agent_id, invite.clone(), &client));
        if let Err(e) = session.accept_invite(&invite).await {
            warn!(session_id = %invite.session_id, error = %e, "join request not delivered");
        }

        let session = {
            let mut registry = self.inner.registry.lock();
            registry
                .sessions
                .entry(invite.session_id.clone())
                .or_insert(session)
                .clone()
        };
        info!(
            agent_id = %self.inner.agent_id,
            session_id = %invite.session_id,
            inviter = %invite.inviter_id,
            "joined session on invite"
        );
        Ok(session)
    }

    /// Send a message within `session_id`.
    ///
    /// An unknown session is rebuilt lazily against the default server; the
    /// owner's identifying code is restored from the local store when the
    /// session row is present.
    pub async fn send_msg(
        &self,
        session_id: &str,
        blocks: &[Block],
        receiver: &str,
        ref_msg_id: &str,
        message_id: &str,
        instruction: Option<&InstructionBlock>,
    ) -> Result<String, AcpError> {
        let session = match self.get(session_id) {
            Some(session) => session,
            None => {
                warn!(session_id, "unknown session, rebuilding from store");
                let client = self.get_or_create_client(&self.inner.default_server.clone());
                let session = Arc::new(Session::owned(
                    &self.inner.agent_id,
                    session_id,
                    "",
                    &client,
                ));
                match self.inner.store.load_session_history(session_id) {
                    Ok(Some(code)) => session.set_identifying_code(&code),
                    Ok(None) => {}
                    Err(e) => warn!(session_id, error = %e, "session history unavailable"),
                }
                let mut registry = self.inner.registry.lock();
                registry
                    .sessions
                    .entry(session_id.to_owned())
                    .or_insert(session)
                    .clone()
            }
        };
        session
            .send_msg(blocks, receiver, ref_msg_id, message_id, instruction)
            .await
    }

    /// Create a stream within `session_id`; never awaits under the registry
    /// lock.
    pub async fn create_stream(
        &self,
        session_id: &str,
        to_aids: &[String],
        content_type: &str,
        ref_msg_id: &str,
    ) -> Result<(String, String), AcpError> {
        let Some(session) = self.get(session_id) else {
            return Err(
                SessionError::new(session_id, SessionOperation::CreateStream, "unknown session")
                    .into(),
            );
        };
        session.create_stream(to_aids, content_type, ref_msg_id).await
    }

    /// Push a text chunk on one of `session_id`'s streams.
    pub async fn send_chunk(
        &self,
        session_id: &str,
        push_url: &str,
        chunk: &str,
    ) -> Result<(), AcpError> {
        let Some(session) = self.get(session_id) else {
            return Err(unknown_session(session_id));
        };
        session.send_chunk(push_url, chunk).await
    }

    /// Push a binary file chunk on one of `session_id`'s streams.
    pub async fn send_file_chunk(
        &self,
        session_id: &str,
        push_url: &str,
        offset: u32,
        bytes: &[u8],
    ) -> Result<bool, AcpError> {
        let Some(session) = self.get(session_id) else {
            return Err(unknown_session(session_id));
        };
        session.send_file_chunk(push_url, offset, bytes).await
    }

    /// Close one of `session_id`'s streams.
    pub async fn close_stream(&self, session_id: &str, push_url: &str) -> Result<(), AcpError> {
        let Some(session) = self.get(session_id) else {
            return Err(unknown_session(session_id));
        };
        session.close_stream(push_url).await;
        Ok(())
    }

    /// Remove and close one session. Returns whether it existed.
    pub async fn close_session(&self, session_id: &str) -> bool {
        let session = self.inner.registry.lock().sessions.remove(session_id);
        match session {
            Some(session) => {
                session.close().await;
                true
            }
            None => {
                debug!(session_id, "close of unknown session");
                false
            }
        }
    }

    /// Close every session and fully reset every transport.
    pub async fn close_all_sessions(&self) {
        let (sessions, clients) = {
            let mut registry = self.inner.registry.lock();
            let sessions: Vec<Arc<Session>> = registry.sessions.drain().map(|(_, s)| s).collect();
            let clients: Vec<Arc<MessageClient>> =
                registry.clients.drain().map(|(_, c)| c).collect();
            registry.auth_cache.clear();
            (sessions, clients)
        };
        self.inner.create_waiters.lock().clear();

        for session in sessions {
            session.close().await;
        }
        for client in clients {
            client.full_reset().await;
        }
        info!(agent_id = %self.inner.agent_id, "all sessions closed");
    }
}

fn unknown_session(session_id: &str) -> AcpError {
    SessionError::new(session_id, SessionOperation::Send, "unknown session").into()
}

fn get_or_create_client(inner: &Arc<ManagerInner>, server_url: &str) -> Arc<MessageClient> {
    let key = server_url.trim_end_matches('/').to_owned();
    {
        let registry = inner.registry.lock();
        if let Some(client) = registry.clients.get(&key) {
            return client.clone();
        }
    }

    // Build outside the lock; a shared AuthClient per server reuses the
    // signature token across transports.
    let auth = {
        let registry = inner.registry.lock();
        registry.auth_cache.get(&key).cloned()
    }
    .unwrap_or_else(|| {
        Arc::new(AuthClient::new(
            &inner.agent_id,
            &key,
            inner.paths.clone(),
            &inner.passphrase,
        ))
    });
    let client = Arc::new(MessageClient::new(
        &inner.agent_id,
        &key,
        auth.clone(),
        inner.config.clone(),
    ));

    wire_client(inner, &client);

    let mut registry = inner.registry.lock();
    if let Some(existing) = registry.clients.get(&key) {
        // Another task won the race; our client was never started.
        return existing.clone();
    }
    let _ = registry.clients.insert(key.clone(), client.clone());
    let _ = registry.auth_cache.insert(key, auth);
    client
}

fn wire_client(inner: &Arc<ManagerInner>, client: &Arc<MessageClient>) {
    let weak_inner = Arc::downgrade(inner);
    let weak_client = Arc::downgrade(client);
    client.set_message_callback(Arc::new(move |raw| {
        if let Some(inner) = weak_inner.upgrade() {
            ingress(&inner, &weak_client, raw);
        }
    }));

    let weak_inner = Arc::downgrade(inner);
    let weak_client = Arc::downgrade(client);
    client.set_open_callback(Arc::new(move || {
        let Some(inner) = weak_inner.upgrade() else { return };
        let Some(client) = weak_client.upgrade() else { return };
        let sessions: Vec<Arc<Session>> =
            inner.registry.lock().sessions.values().cloned().collect();
        // Rejoin runs on its own task; the open callback must not block
        // the connection task.
        let _ = tokio::spawn(async move {
            for session in sessions {
                if session.is_on(&client) {
                    session.on_transport_open().await;
                }
            }
        });
    }));

    if let Some(callback) = inner.disconnect_cb.lock().clone() {
        client.set_disconnect_callback(callback);
    }
    if let Some(callback) = inner.reconnect_cb.lock().clone() {
        client.set_reconnect_callback(callback);
    }
}

/// Route one inbound frame. Runs synchronously on the receive task, so
/// every branch only hands off; no blocking, no awaits.
fn ingress(inner: &Arc<ManagerInner>, client: &Weak<MessageClient>, raw: &str) {
    let frame = match WsFrame::parse(raw) {
        Ok(frame) => frame,
        Err(e) => {
            error!(error = %e, "inbound frame is not a command object");
            return;
        }
    };

    match frame.cmd.as_str() {
        CMD_CREATE_SESSION_ACK => match serde_json::from_value::<CreateSessionAck>(frame.data) {
            Ok(ack) => {
                let waiter = inner.create_waiters.lock().remove(&ack.request_id);
                if ack.status_code != 200 {
                    error!(
                        request_id = %ack.request_id,
                        status = ack.status_code,
                        "create_session rejected by server"
                    );
                }
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(ack);
                    }
                    None => debug!("create_session_ack with no waiter"),
                }
            }
            Err(e) => error!(error = %e, "undecodable create_session_ack"),
        },

        CMD_SESSION_MESSAGE => match serde_json::from_value::<SessionMessage>(frame.data) {
            Ok(message) => {
                let callback = inner.on_session_message.lock().clone();
                match callback {
                    Some(callback) => callback(message),
                    None => error!("session_message received before callback registered"),
                }
            }
            Err(e) => error!(error = %e, "undecodable session_message"),
        },

        CMD_INVITE_AGENT_ACK => match serde_json::from_value::<InviteAgentAck>(frame.data) {
            Ok(ack) => {
                info!(session_id = %ack.session_id, status = ack.status_code, "invite ack");
                let callback = inner.on_invite_ack.lock().clone();
                if let Some(callback) = callback {
                    callback(ack);
                }
            }
            Err(e) => error!(error = %e, "undecodable invite_agent_ack"),
        },

        CMD_SESSION_MESSAGE_ACK => match serde_json::from_value::<SessionMessageAck>(frame.data) {
            Ok(ack) => {
                let known = inner.registry.lock().sessions.contains_key(&ack.session_id);
                if known {
                    let callback = inner.on_message_ack.lock().clone();
                    if let Some(callback) = callback {
                        callback(ack);
                    }
                }
            }
            Err(e) => error!(error = %e, "undecodable session_message_ack"),
        },

        CMD_SESSION_CREATE_STREAM_ACK => {
            let request_id = frame
                .data
                .get("request_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_owned();
            if request_id.is_empty() {
                error!("stream ack without request_id");
                return;
            }
            let Some(client) = client.upgrade() else { return };
            if !client
                .waiters()
                .signal(&request_id, StreamSignal::Ack(frame.data))
            {
                warn!(request_id, "stream ack with no waiter (late or cleaned)");
            }
        }

        CMD_SYSTEM_MESSAGE => match serde_json::from_value::<SystemMessage>(frame.data) {
            Ok(message) => {
                if message.event_type == "Session dismissed" {
                    let removed = inner.registry.lock().sessions.remove(&message.session_id);
                    if let Some(session) = removed {
                        info!(session_id = %message.session_id, "session dismissed by server");
                        let _ = tokio::spawn(async move { session.close().await });
                    }
                }
                let callback = inner.on_system_message.lock().clone();
                if let Some(callback) = callback {
                    callback(message);
                }
            }
            Err(e) => error!(error = %e, "undecodable system_message"),
        },

        other => debug!(cmd = other, "unhandled command ignored"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
