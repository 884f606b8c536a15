//! The top-level per-identity runtime object.
//!
//! An [`Agent`] composes the auth client, heartbeat client, session
//! manager, dispatch pipeline, scheduler, metrics, and monitoring service
//! for one identity. It owns the offline → online → offline lifecycle,
//! `reset()` back to a reusable offline state, and the public messaging
//! API the hosting process calls.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use acp_auth::{AuthClient, OnlineState};
use acp_core::AgentId;
use acp_core::blocks::{Block, InstructionBlock, encode_envelope, unix_millis};
use acp_core::config::{DispatchConfig, SchedulerConfig, TransportConfig};
use acp_core::errors::{AcpError, SessionError, SessionOperation};
use acp_core::paths::{IdentityPaths, seed_passphrase};
use acp_heartbeat::HeartbeatClient;
use acp_metrics::{MetricsCollector, MetricsSummary, MonitoringService};
use acp_scheduler::MessageScheduler;
use acp_session::SessionManager;
use acp_store::{ConversationRow, FriendRow, MessageRow, Store};
use acp_transport::{DisconnectCallback, ReconnectCallback};
use acp_wire::commands::SessionMessage;

use crate::handlers::{HandlerRegistry, InboundMessage, MessageHandler};
use crate::pipeline::Pipeline;

/// Sign-in retry budget used by `online()`.
const ONLINE_SIGN_IN_RETRIES: u32 = 10;
/// Monitoring snapshot cadence.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10);
/// Metrics JSON sync cadence.
const METRICS_SYNC_INTERVAL: Duration = Duration::from_secs(120);
/// Headroom added to the scheduler's outer timeout so the in-task handler
/// timeout fires first and records its metric.
const SCHEDULER_TIMEOUT_HEADROOM: Duration = Duration::from_secs(5);
/// Delay before a synthesized offline notice is delivered.
const OFFLINE_NOTICE_DELAY: Duration = Duration::from_millis(300);

/// Per-identity proxy configuration persisted as JSON.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
struct ProxyConfig {
    #[serde(default)]
    use_system_proxy: bool,
}

struct AgentInner {
    id: AgentId,
    ep_url: String,
    paths: IdentityPaths,
    passphrase: String,
    transport_config: TransportConfig,
    scheduler_config: SchedulerConfig,
    pipeline: Arc<Pipeline>,
    monitoring: Mutex<Option<Arc<MonitoringService>>>,
    heartbeat: Mutex<Option<Arc<HeartbeatClient>>>,
    auth: Mutex<Option<Arc<AuthClient>>>,
    online: AtomicBool,
    tasks_cancel: Mutex<CancellationToken>,
    dispatcher_task: Mutex<Option<JoinHandle<()>>>,
    metrics_task: Mutex<Option<JoinHandle<()>>>,
    disconnect_cb: Mutex<Option<DisconnectCallback>>,
    reconnect_cb: Mutex<Option<ReconnectCallback>>,
    use_system_proxy: AtomicBool,
}

/// One hosted identity.
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    /// Construct an identity runtime from stored credentials.
    ///
    /// Starts the dispatcher, metrics sync, and monitoring loops
    /// immediately; the identity stays offline until [`online`](Self::online).
    /// Must run inside a tokio runtime.
    pub fn new(
        id: &str,
        app_root: impl Into<PathBuf>,
        cert_dir: impl Into<PathBuf>,
        seed: &str,
        ep_url: &str,
    ) -> Result<Self, AcpError> {
        Self::with_configs(
            id,
            app_root,
            cert_dir,
            seed,
            ep_url,
            TransportConfig::default(),
            SchedulerConfig::default(),
            DispatchConfig::default(),
        )
    }

    /// [`new`](Self::new) with explicit configuration.
    #[allow(clippy::too_many_arguments)]
    pub fn with_configs(
        id: &str,
        app_root: impl Into<PathBuf>,
        cert_dir: impl Into<PathBuf>,
        seed: &str,
        ep_url: &str,
        transport_config: TransportConfig,
        scheduler_config: SchedulerConfig,
        dispatch_config: DispatchConfig,
    ) -> Result<Self, AcpError> {
        let agent_id = AgentId::parse(id)?;
        let paths = IdentityPaths::new(app_root, cert_dir, id);
        paths.ensure_directories()?;
        let passphrase = seed_passphrase(seed);

        let store = Arc::new(Store::open(
            paths.database_path().to_string_lossy().as_ref(),
            id,
        )?);
        let metrics = Arc::new(MetricsCollector::new());
        let scheduler = Arc::new(MessageScheduler::new(
            scheduler_config.clone(),
            dispatch_config.handler_timeout() + SCHEDULER_TIMEOUT_HEADROOM,
        ));
        let pipeline = Arc::new(Pipeline {
            agent_id: id.to_owned(),
            registry: Arc::new(HandlerRegistry::new()),
            metrics: metrics.clone(),
            store,
            scheduler: Mutex::new(scheduler),
            manager: Mutex::new(None),
            dispatch_tx: Mutex::new(None),
            config: dispatch_config,
        });

        // Monitoring is best-effort: a broken store must not keep the
        // identity from running.
        let monitoring = match MonitoringService::new(
            id,
            metrics,
            paths.metrics_db_path().to_string_lossy().as_ref(),
            SNAPSHOT_INTERVAL,
        ) {
            Ok(service) => {
                service.start();
                Some(Arc::new(service))
            }
            Err(e) => {
                error!(agent_id = %id, error = %e, "monitoring service unavailable");
                None
            }
        };

        let inner = Arc::new(AgentInner {
            id: agent_id,
            ep_url: ep_url.trim_end_matches('/').to_owned(),
            paths,
            passphrase,
            transport_config,
            scheduler_config,
            pipeline,
            monitoring: Mutex::new(monitoring),
            heartbeat: Mutex::new(None),
            auth: Mutex::new(None),
            online: AtomicBool::new(false),
            tasks_cancel: Mutex::new(CancellationToken::new()),
            dispatcher_task: Mutex::new(None),
            metrics_task: Mutex::new(None),
            disconnect_cb: Mutex::new(None),
            reconnect_cb: Mutex::new(None),
            use_system_proxy: AtomicBool::new(false),
        });
        load_proxy_config(&inner);
        start_background_tasks(&inner);
        info!(agent_id = %inner.id, "agent constructed");
        Ok(Self { inner })
    }

    /// The identity's full id.
    #[must_use]
    pub fn id(&self) -> &AgentId {
        &self.inner.id
    }

    /// Whether the identity is online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Relaxed)
    }

    /// The handler registry.
    #[must_use]
    pub fn handlers(&self) -> Arc<HandlerRegistry> {
        self.inner.pipeline.registry.clone()
    }

    /// Register a handler: global when both scopes are empty, else
    /// session- or command-scoped.
    pub fn add_message_handler(&self, handler: MessageHandler, session_id: &str, command: &str) {
        let registry = &self.inner.pipeline.registry;
        if !session_id.is_empty() {
            registry.set_session_handler(session_id, handler);
        } else if !command.is_empty() {
            registry.set_command_handler(command, handler);
        } else {
            registry.add_global(handler);
        }
    }

    // ── lifecycle ───────────────────────────────────────────────────────────

    /// Bring the identity online: sign in, start the heartbeat channel,
    /// and build a fresh session manager wired into the dispatch queue.
    pub async fn online(&self) -> Result<(), AcpError> {
        let inner = &self.inner;
        info!(agent_id = %inner.id, "going online");

        // A dispatcher stopped by a previous offline() comes back first so
        // nothing inbound is lost while the transports come up.
        if inner.pipeline.dispatch_tx.lock().is_none() {
            start_background_tasks(inner);
        }

        let auth = Arc::new(AuthClient::new(
            inner.id.as_str(),
            &inner.ep_url,
            inner.paths.clone(),
            &inner.passphrase,
        ));
        let sign_in = auth.sign_in(ONLINE_SIGN_IN_RETRIES).await;
        let info = match sign_in {
            Ok(info) => info,
            Err(e) => {
                inner.online.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let Some(heartbeat_server) = info.heartbeat_server.clone() else {
            inner.online.store(false, Ordering::SeqCst);
            return Err(AcpError::internal(
                "ONLINE_NO_HEARTBEAT_SERVER",
                "sign-in response carried no heartbeat server",
            ));
        };
        let Some(message_server) = info.message_server.clone() else {
            inner.online.store(false, Ordering::SeqCst);
            return Err(AcpError::internal(
                "ONLINE_NO_MESSAGE_SERVER",
                "sign-in response carried no message server",
            ));
        };

        // Replace any previous heartbeat and session state.
        let old_heartbeat = inner.heartbeat.lock().take();
        if let Some(heartbeat) = old_heartbeat {
            heartbeat.offline().await;
            heartbeat.sign_out().await;
        }
        let old_manager = inner.pipeline.manager.lock().take();
        if let Some(manager) = old_manager {
            manager.close_all_sessions().await;
        }

        let manager = Arc::new(SessionManager::new(
            inner.id.as_str(),
            &message_server,
            inner.paths.clone(),
            &inner.passphrase,
            inner.transport_config.clone(),
            inner.pipeline.store.clone(),
        ));
        wire_manager(inner, &manager);
        *inner.pipeline.manager.lock() = Some(manager.clone());

        let heartbeat_auth = Arc::new(AuthClient::new(
            inner.id.as_str(),
            &heartbeat_server,
            inner.paths.clone(),
            &inner.passphrase,
        ));
        let heartbeat = Arc::new(HeartbeatClient::new(inner.id.as_str(), heartbeat_auth));
        let invite_manager = Arc::downgrade(&manager);
        heartbeat.set_on_invite(Arc::new(move |invite| {
            let Some(manager) = invite_manager.upgrade() else { return };
            let _ = tokio::spawn(async move {
                if let Err(e) = manager.join_session(invite).await {
                    error!(error = %e, "join on heartbeat invite failed");
                }
            });
        }));
        heartbeat.online().await?;
        *inner.heartbeat.lock() = Some(heartbeat);
        *inner.auth.lock() = Some(auth);

        // A scheduler shut down by a previous offline() is rebuilt.
        {
            let mut scheduler = inner.pipeline.scheduler.lock();
            if !scheduler.is_running() {
                *scheduler = Arc::new(MessageScheduler::new(
                    inner.scheduler_config.clone(),
                    inner.pipeline.config.handler_timeout() + SCHEDULER_TIMEOUT_HEADROOM,
                ));
            }
        }

        inner.online.store(true, Ordering::SeqCst);
        info!(agent_id = %inner.id, "online");
        Ok(())
    }

    /// Take the identity fully offline and release every resource.
    pub async fn offline(&self) {
        let inner = &self.inner;
        info!(agent_id = %inner.id, "going offline");
        inner.online.store(false, Ordering::SeqCst);

        stop_background_tasks(inner).await;

        let monitoring = inner.monitoring.lock().clone();
        if let Some(monitoring) = monitoring {
            monitoring.stop(false).await;
        }

        let heartbeat = inner.heartbeat.lock().take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.offline().await;
            heartbeat.sign_out().await;
        }
        let auth = inner.auth.lock().take();
        if let Some(auth) = auth {
            auth.sign_out().await;
        }
        let manager = inner.pipeline.manager.lock().take();
        if let Some(manager) = manager {
            manager.close_all_sessions().await;
        }

        let scheduler = inner.pipeline.scheduler.lock().clone();
        scheduler.shutdown(true).await;
        info!(agent_id = %inner.id, "offline");
    }

    /// Reset to a clean offline state, preserving identity and global
    /// handlers. Safe to call repeatedly; `online()` afterwards behaves
    /// like a fresh start.
    pub async fn reset(&self) -> bool {
        let inner = &self.inner;
        info!(agent_id = %inner.id, "resetting");
        let mut clean = true;

        // 1. Mark offline so no new work is accepted.
        inner.online.store(false, Ordering::SeqCst);

        // 2–3. Stop the dispatcher and metrics sync.
        stop_background_tasks(inner).await;

        // 4. Stop monitoring without blocking.
        let monitoring = inner.monitoring.lock().clone();
        if let Some(monitoring) = monitoring {
            monitoring.stop(false).await;
        }

        // 5. Close the session manager (fully resets every transport).
        let manager = inner.pipeline.manager.lock().take();
        if let Some(manager) = manager {
            manager.close_all_sessions().await;
        }

        // 6. Close the heartbeat client.
        let heartbeat = inner.heartbeat.lock().take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.offline().await;
            heartbeat.sign_out().await;
        }
        let _ = inner.auth.lock().take();

        // 7. Drain the dispatch queue.
        inner.pipeline.drain_queue();

        // 8. Clear scoped handlers, keeping the global list.
        inner.pipeline.registry.clear_scoped();

        // 9. Restart the dispatcher and metrics sync for the next online().
        start_background_tasks(inner);
        if inner.pipeline.dispatch_tx.lock().is_none() {
            clean = false;
        }

        info!(agent_id = %inner.id, clean, "reset complete");
        clean
    }

    /// `reset()` followed by `online()`.
    pub async fn reset_and_reconnect(&self) -> Result<(), AcpError> {
        if !self.reset().await {
            warn!(agent_id = %self.inner.id, "reset was partial, reconnecting anyway");
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.online().await
    }

    // ── callbacks ───────────────────────────────────────────────────────────

    /// Register the transport disconnect callback (applied to every current
    /// and future message client).
    pub fn set_disconnect_callback(&self, callback: DisconnectCallback) {
        *self.inner.disconnect_cb.lock() = Some(callback.clone());
        let manager = self.inner.pipeline.manager.lock().clone();
        if let Some(manager) = manager {
            manager.set_disconnect_callback(callback);
        }
    }

    /// Register the transport reconnect callback.
    pub fn set_reconnect_callback(&self, callback: ReconnectCallback) {
        *self.inner.reconnect_cb.lock() = Some(callback.clone());
        let manager = self.inner.pipeline.manager.lock().clone();
        if let Some(manager) = manager {
            manager.set_reconnect_callback(callback);
        }
    }

    // ── messaging ───────────────────────────────────────────────────────────

    fn manager(&self) -> Result<Arc<SessionManager>, AcpError> {
        self.inner.pipeline.manager.lock().clone().ok_or_else(|| {
            SessionError::new("", SessionOperation::Send, "identity is offline")
                .transient()
                .into()
        })
    }

    /// Create a session; returns its server-assigned id. The session row is
    /// persisted so the owner can rejoin after a restart.
    pub async fn create_session(
        &self,
        name: &str,
        subject: &str,
        session_type: &str,
    ) -> Result<String, AcpError> {
        let manager = self.manager()?;
        let session = manager.create_session(name, subject, session_type).await?;
        let session_id = session.session_id().to_owned();
        if let Err(e) = self.inner.pipeline.store.create_session(
            &session_id,
            &session.identifying_code(),
            name,
            session_type,
        ) {
            warn!(session_id, error = %e, "session row not persisted");
        }
        Ok(session_id)
    }

    /// Invite `to_aid` into `session_id` (owner only).
    pub async fn invite_member(&self, session_id: &str, to_aid: &str) -> Result<(), AcpError> {
        let manager = self.manager()?;
        let Some(session) = manager.get(session_id) else {
            return Err(SessionError::new(
                session_id,
                SessionOperation::Invite,
                "unknown session",
            )
            .into());
        };
        session.invite_member(to_aid).await?;
        if let Err(e) = self.inner.pipeline.store.record_invite(session_id, to_aid) {
            warn!(session_id, error = %e, "invite row not persisted");
        }
        Ok(())
    }

    /// Send blocks to `to_aids` within a session.
    ///
    /// If the identity is offline one `online()` attempt is made first.
    /// The message is inserted locally (role `user`, status `sent`) unless
    /// `insert` is false, then handed to the session transport.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_message(
        &self,
        session_id: &str,
        to_aids: &[String],
        blocks: Vec<Block>,
        ref_msg_id: &str,
        message_id: &str,
        instruction: Option<InstructionBlock>,
        insert: bool,
    ) -> Result<String, AcpError> {
        if !self.is_online() {
            self.online().await?;
        }

        let message_id = if message_id.is_empty() {
            unix_millis().to_string()
        } else {
            message_id.to_owned()
        };
        if insert {
            let content = serde_json::to_string(&blocks).unwrap_or_default();
            let instruction_json = instruction
                .as_ref()
                .and_then(|i| serde_json::to_string(i).ok())
                .unwrap_or_default();
            if let Err(e) = self.inner.pipeline.store.insert_message(
                "user",
                session_id,
                self.inner.id.as_str(),
                ref_msg_id,
                &to_aids.join(","),
                &instruction_json,
                &content,
                "text",
                "sent",
                &message_id,
            ) {
                warn!(session_id, error = %e, "outbound message not persisted");
            }
        }

        let manager = self.manager()?;
        manager
            .send_msg(
                session_id,
                &blocks,
                &to_aids.join(";"),
                ref_msg_id,
                &message_id,
                instruction.as_ref(),
            )
            .await
    }

    /// Send a plain text content block.
    pub async fn send_message_content(
        &self,
        session_id: &str,
        to_aids: &[String],
        text: &str,
    ) -> Result<String, AcpError> {
        self.send_message(
            session_id,
            to_aids,
            vec![Block::content(text)],
            "",
            "",
            None,
            true,
        )
        .await
    }

    /// Reply to an inbound message within its session, threading on its id.
    pub async fn reply_message(
        &self,
        msg: &InboundMessage,
        blocks: Vec<Block>,
    ) -> Result<String, AcpError> {
        self.send_message(
            msg.session_id(),
            &[msg.sender().to_owned()],
            blocks,
            &msg.raw.message_id,
            "",
            None,
            true,
        )
        .await
    }

    /// Create a throwaway session to `to_aid`, optionally binding a
    /// one-shot session handler for the reply, and send `blocks`.
    pub async fn quick_send_message(
        &self,
        to_aid: &str,
        blocks: Vec<Block>,
        reply_handler: Option<MessageHandler>,
    ) -> Result<String, AcpError> {
        let session_id = self.create_session("quick session", "", "public").await?;
        self.invite_member(&session_id, to_aid).await?;

        if let Some(handler) = reply_handler {
            let registry = self.inner.pipeline.registry.clone();
            let sid = session_id.clone();
            let one_shot: MessageHandler = Arc::new(move |msg| {
                let registry = registry.clone();
                let sid = sid.clone();
                let handler = handler.clone();
                Box::pin(async move {
                    let _ = registry.remove_session_handler(&sid);
                    handler(msg).await
                })
            });
            self.inner
                .pipeline
                .registry
                .set_session_handler(&session_id, one_shot);
        }

        let _ = self
            .send_message(
                &session_id,
                &[to_aid.to_owned()],
                blocks,
                "",
                "",
                None,
                true,
            )
            .await?;
        Ok(session_id)
    }

    /// Create a sub-stream within a session.
    pub async fn create_stream(
        &self,
        session_id: &str,
        to_aids: &[String],
        content_type: &str,
        ref_msg_id: &str,
    ) -> Result<(String, String), AcpError> {
        self.manager()?
            .create_stream(session_id, to_aids, content_type, ref_msg_id)
            .await
    }

    /// Push a text chunk on an open stream.
    pub async fn send_chunk_to_stream(
        &self,
        session_id: &str,
        push_url: &str,
        chunk: &str,
    ) -> Result<(), AcpError> {
        self.manager()?.send_chunk(session_id, push_url, chunk).await
    }

    /// Push a binary file chunk; `Ok(false)` asks the caller to pace.
    pub async fn send_chunk_to_file_stream(
        &self,
        session_id: &str,
        push_url: &str,
        offset: u32,
        bytes: &[u8],
    ) -> Result<bool, AcpError> {
        self.manager()?
            .send_file_chunk(session_id, push_url, offset, bytes)
            .await
    }

    /// Close an open stream.
    pub async fn close_stream(&self, session_id: &str, push_url: &str) -> Result<(), AcpError> {
        self.manager()?.close_stream(session_id, push_url).await
    }

    /// Leave or close a session.
    pub async fn close_session(&self, session_id: &str) -> Result<bool, AcpError> {
        Ok(self.manager()?.close_session(session_id).await)
    }

    /// Close a session and delete its local rows.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), AcpError> {
        if let Ok(manager) = self.manager() {
            let _ = manager.close_session(session_id).await;
        }
        self.inner
            .pipeline
            .store
            .delete_session(session_id)
            .map_err(AcpError::from)
    }

    /// Ask the authority which of `aids` are online.
    pub async fn get_online_status(&self, aids: &[String]) -> Result<Vec<OnlineState>, AcpError> {
        let auth = self.inner.auth.lock().clone();
        let Some(auth) = auth else {
            return Err(AcpError::internal("OFFLINE", "identity is offline"));
        };
        auth.query_online_state(aids).await.map_err(AcpError::from)
    }

    // ── local data ──────────────────────────────────────────────────────────

    /// Page through a session's stored messages.
    pub fn message_list(
        &self,
        session_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<MessageRow>, AcpError> {
        self.inner
            .pipeline
            .store
            .message_list(session_id, page, page_size)
            .map_err(AcpError::from)
    }

    /// Page through stored conversations.
    pub fn conversation_list(&self, page: u32, page_size: u32) -> Result<Vec<ConversationRow>, AcpError> {
        self.inner
            .pipeline
            .store
            .conversation_list(page, page_size)
            .map_err(AcpError::from)
    }

    /// Member identities recorded for a session.
    pub fn session_member_list(&self, session_id: &str) -> Result<Vec<String>, AcpError> {
        self.inner
            .pipeline
            .store
            .session_member_list(session_id)
            .map_err(AcpError::from)
    }

    /// Add or replace a friend entry.
    pub fn add_friend_agent(
        &self,
        aid: &str,
        name: &str,
        avatar_url: &str,
        description: &str,
    ) -> Result<(), AcpError> {
        self.inner
            .pipeline
            .store
            .add_friend(aid, name, avatar_url, description)
            .map_err(AcpError::from)
    }

    /// Remove a friend entry.
    pub fn delete_friend_agent(&self, aid: &str) -> Result<bool, AcpError> {
        self.inner.pipeline.store.delete_friend(aid).map_err(AcpError::from)
    }

    /// All friend entries.
    pub fn friend_agent_list(&self) -> Result<Vec<FriendRow>, AcpError> {
        self.inner.pipeline.store.friend_list().map_err(AcpError::from)
    }

    // ── observability ───────────────────────────────────────────────────────

    /// Current metrics summary.
    #[must_use]
    pub fn metrics(&self) -> MetricsSummary {
        self.inner.pipeline.metrics.summary()
    }

    /// The monitoring service, when its store opened successfully.
    #[must_use]
    pub fn monitoring(&self) -> Option<Arc<MonitoringService>> {
        self.inner.monitoring.lock().clone()
    }

    /// One line of health per message transport.
    #[must_use]
    pub fn connection_health_summary(&self) -> String {
        let manager = self.inner.pipeline.manager.lock().clone();
        match manager {
            Some(manager) => {
                let lines: Vec<String> = manager
                    .clients()
                    .iter()
                    .map(|client| format!("{}: {}", client.server_url(), client.health_summary()))
                    .collect();
                if lines.is_empty() {
                    "no transports".to_owned()
                } else {
                    lines.join("\n")
                }
            }
            None => "offline".to_owned(),
        }
    }

    // ── proxy configuration ─────────────────────────────────────────────────

    /// Whether handshakes may use the system proxy.
    #[must_use]
    pub fn use_system_proxy(&self) -> bool {
        self.inner.use_system_proxy.load(Ordering::Relaxed)
    }

    /// Update and persist the proxy preference.
    pub fn set_use_system_proxy(&self, value: bool) {
        self.inner.use_system_proxy.store(value, Ordering::Relaxed);
        let config = ProxyConfig {
            use_system_proxy: value,
        };
        let path = self.inner.paths.proxy_config_path();
        match serde_json::to_string_pretty(&config) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    warn!(path = %path.display(), error = %e, "proxy config not saved");
                }
            }
            Err(e) => warn!(error = %e, "proxy config not serializable"),
        }
    }
}

fn load_proxy_config(inner: &Arc<AgentInner>) {
    let path = inner.paths.proxy_config_path();
    match std::fs::read_to_string(&path) {
        Ok(text) => match serde_json::from_str::<ProxyConfig>(&text) {
            Ok(config) => {
                inner
                    .use_system_proxy
                    .store(config.use_system_proxy, Ordering::Relaxed);
                debug!(use_system_proxy = config.use_system_proxy, "proxy config loaded");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "proxy config unreadable"),
        },
        Err(_) => {
            // First run: write the default so operators can find the knob.
            let default = serde_json::to_string_pretty(&ProxyConfig::default()).unwrap_or_default();
            if let Err(e) = std::fs::write(&path, default) {
                debug!(path = %path.display(), error = %e, "default proxy config not written");
            }
        }
    }
}

fn wire_manager(inner: &Arc<AgentInner>, manager: &Arc<SessionManager>) {
    // Stage A: inbound session messages go straight onto the dispatch queue.
    let pipeline = inner.pipeline.clone();
    manager.set_on_session_message(Arc::new(move |msg| pipeline.enqueue(msg)));

    // Invite 404: the invitee is offline; surface a local error block.
    let pipeline = inner.pipeline.clone();
    let agent_id = inner.id.as_str().to_owned();
    manager.set_on_invite_ack(Arc::new(move |ack| {
        if ack.status_code == 404 && !ack.acceptor_id.is_empty() {
            synthesize_offline_notice(&pipeline, &ack.session_id, &ack.acceptor_id, &agent_id);
        }
    }));

    // Message ack 404: one notice per offline receiver.
    let pipeline = inner.pipeline.clone();
    let agent_id = inner.id.as_str().to_owned();
    manager.set_on_message_ack(Arc::new(move |ack| {
        if ack.status_code == 404 {
            for receiver in &ack.offline_receivers {
                synthesize_offline_notice(&pipeline, &ack.session_id, receiver, &agent_id);
            }
        }
    }));

    manager.set_on_system_message(Arc::new(|message| {
        info!(
            session_id = %message.session_id,
            event = %message.event_type,
            "system message"
        );
    }));

    if let Some(callback) = inner.disconnect_cb.lock().clone() {
        manager.set_disconnect_callback(callback);
    }
    if let Some(callback) = inner.reconnect_cb.lock().clone() {
        manager.set_reconnect_callback(callback);
    }
}

/// Deliver a locally synthesized "recipient offline" error through the
/// normal inbound path so user handlers observe it like any message.
fn synthesize_offline_notice(
    pipeline: &Arc<Pipeline>,
    session_id: &str,
    offline_aid: &str,
    agent_id: &str,
) {
    let blocks = vec![Block::error(format!("recipient offline: {offline_aid}"))];
    let raw = SessionMessage {
        message_id: unix_millis().to_string(),
        session_id: session_id.to_owned(),
        ref_msg_id: String::new(),
        sender: offline_aid.to_owned(),
        receiver: agent_id.to_owned(),
        message: encode_envelope(&blocks),
        timestamp: unix_millis().to_string(),
        instruction: None,
    };
    let pipeline = pipeline.clone();
    let _ = tokio::spawn(async move {
        tokio::time::sleep(OFFLINE_NOTICE_DELAY).await;
        pipeline.enqueue(raw);
    });
}

fn start_background_tasks(inner: &Arc<AgentInner>) {
    let cancel = CancellationToken::new();
    *inner.tasks_cancel.lock() = cancel.clone();
    *inner.dispatcher_task.lock() = Some(inner.pipeline.start_dispatcher(cancel.clone()));
    *inner.metrics_task.lock() = Some(tokio::spawn(metrics_sync_main(
        inner.pipeline.clone(),
        inner.paths.metrics_json_path(),
        cancel,
    )));
}

async fn stop_background_tasks(inner: &Arc<AgentInner>) {
    inner.tasks_cancel.lock().cancel();
    let dispatcher = inner.dispatcher_task.lock().take();
    let metrics = inner.metrics_task.lock().take();
    for task in [dispatcher, metrics].into_iter().flatten() {
        let aborter = task.abort_handle();
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            aborter.abort();
        }
    }
    // The queue dies with its dispatcher; anything still inside is dropped.
    inner.pipeline.drain_queue();
}

/// Periodically mirror the metrics summary to `<private>/metrics.json`.
async fn metrics_sync_main(pipeline: Arc<Pipeline>, path: PathBuf, cancel: CancellationToken) {
    let mut first = true;
    loop {
        if first {
            first = false;
        } else {
            tokio::select! {
                () = tokio::time::sleep(METRICS_SYNC_INTERVAL) => {}
                () = cancel.cancelled() => break,
            }
        }
        if cancel.is_cancelled() {
            break;
        }

        pipeline
            .metrics
            .update_dispatch_queue_size(pipeline.queue_depth());
        let summary = pipeline.metrics.summary();
        let mut value = match serde_json::to_value(&summary) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "metrics summary not serializable");
                continue;
            }
        };
        value["agent_id"] = serde_json::Value::String(pipeline.agent_id.clone());
        value["timestamp"] = serde_json::Value::from(unix_millis());

        match serde_json::to_string_pretty(&value) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    warn!(path = %path.display(), error = %e, "metrics sync write failed");
                }
            }
            Err(e) => warn!(error = %e, "metrics sync serialization failed"),
        }
    }
    debug!("metrics sync stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
