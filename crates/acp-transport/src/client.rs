//! Full-duplex WebSocket message transport.
//!
//! One `MessageClient` owns the connection lifecycle to one message server:
//! connect, authenticated session, receive loop, health watchdog,
//! stale-stream cleanup, graceful or abnormal close, and exponential-backoff
//! reconnection. Successive connection attempts are distinguished by a
//! monotonically increasing connection id; background tasks that observe a
//! different id know they have been superseded and exit without touching
//! shared state.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};
use tracing::{debug, error, info, warn};

use acp_auth::AuthClient;
use acp_core::blocks::unix_millis;
use acp_core::config::TransportConfig;
use acp_core::errors::{AcpError, TransportError};
use acp_core::retry::widen;

use crate::state::{ConnState, ConnectionInfo};
use crate::waiters::StreamWaiters;

/// Close code synthesized for protocol-level failures.
const CLOSE_ABNORMAL: u16 = 1006;
/// Normal close code; does not trigger reconnection.
const CLOSE_NORMAL: u16 = 1000;
/// Bounded wait for one outbound write.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Settle time before a reconnect attempt is verified.
const VERIFY_SETTLE: Duration = Duration::from_millis(200);
/// Delay before the reconnect worker starts after a close.
const RECONNECT_SPAWN_DELAY: Duration = Duration::from_millis(500);
/// Cadence of the stale-stream cleaner.
const CLEANER_INTERVAL: Duration = Duration::from_secs(30);
/// Age beyond which a pending stream request is abandoned.
const STALE_STREAM_AGE_MS: u64 = 15_000;
/// Sign-in retry budget when the transport must authenticate itself.
const SIGN_IN_RETRIES: u32 = 3;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Synchronous callback receiving each raw inbound text frame.
///
/// Runs on the receive task; it must only enqueue, never block.
pub type MessageCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Invoked once per established connection, before buffered sends drain.
pub type OpenCallback = Arc<dyn Fn() + Send + Sync>;
/// Invoked on abnormal close: `(agent_id, server_url, code, reason)`.
pub type DisconnectCallback = Arc<dyn Fn(&str, &str, Option<u16>, &str) + Send + Sync>;
/// Invoked after a verified reconnect: `(agent_id, server_url)`.
pub type ReconnectCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

struct Meta {
    state: ConnState,
    connection_id: u64,
    connecting_since_ms: u64,
    is_retrying: bool,
    reconnect_attempts: u32,
    current_backoff: Duration,
}

struct Inner {
    agent_id: String,
    server_url: String,
    config: TransportConfig,
    auth: Arc<AuthClient>,
    meta: Mutex<Meta>,
    connected_tx: watch::Sender<bool>,
    ws_open: AtomicBool,
    shutdown: AtomicBool,
    sink: tokio::sync::Mutex<Option<(u64, WsSink)>>,
    outbound: Mutex<VecDeque<String>>,
    waiters: StreamWaiters,
    received_total: AtomicU64,
    last_pong_ms: AtomicU64,
    on_message: Mutex<Option<MessageCallback>>,
    on_open: Mutex<Option<OpenCallback>>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
    on_reconnect: Mutex<Option<ReconnectCallback>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    fn set_connected(&self, value: bool) {
        let _ = self.connected_tx.send_replace(value);
    }
}

/// Build the authenticated WebSocket URL for a message server.
#[must_use]
pub fn build_ws_url(server_url: &str, agent_id: &str, signature: &str) -> String {
    let root = server_url
        .trim_end_matches('/')
        .replace("https://", "wss://")
        .replace("http://", "ws://");
    format!("{root}/session?agent_id={agent_id}&signature={signature}")
}

/// WebSocket message transport to one server.
pub struct MessageClient {
    inner: Arc<Inner>,
}

impl MessageClient {
    /// Create a client; no connection is made until [`start`](Self::start)
    /// or the first [`send`](Self::send).
    #[must_use]
    pub fn new(
        agent_id: &str,
        server_url: &str,
        auth: Arc<AuthClient>,
        config: TransportConfig,
    ) -> Self {
        let (connected_tx, _) = watch::channel(false);
        let base = config.reconnect_base();
        Self {
            inner: Arc::new(Inner {
                agent_id: agent_id.to_owned(),
                server_url: server_url.trim_end_matches('/').to_owned(),
                config,
                auth,
                meta: Mutex::new(Meta {
                    state: ConnState::Disconnected,
                    connection_id: 0,
                    connecting_since_ms: 0,
                    is_retrying: false,
                    reconnect_attempts: 0,
                    current_backoff: base,
                }),
                connected_tx,
                ws_open: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                sink: tokio::sync::Mutex::new(None),
                outbound: Mutex::new(VecDeque::new()),
                waiters: StreamWaiters::new(),
                received_total: AtomicU64::new(0),
                last_pong_ms: AtomicU64::new(0),
                on_message: Mutex::new(None),
                on_open: Mutex::new(None),
                on_disconnect: Mutex::new(None),
                on_reconnect: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The message server this client talks to.
    #[must_use]
    pub fn server_url(&self) -> &str {
        &self.inner.server_url
    }

    /// The shared auth client (token source).
    #[must_use]
    pub fn auth(&self) -> Arc<AuthClient> {
        self.inner.auth.clone()
    }

    /// The stream-creation waiter registry.
    #[must_use]
    pub fn waiters(&self) -> &StreamWaiters {
        &self.inner.waiters
    }

    /// Register the inbound frame callback.
    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.inner.on_message.lock() = Some(callback);
    }

    /// Register the connection-open callback (session rejoin hook).
    pub fn set_open_callback(&self, callback: OpenCallback) {
        *self.inner.on_open.lock() = Some(callback);
    }

    /// Register the abnormal-disconnect callback.
    pub fn set_disconnect_callback(&self, callback: DisconnectCallback) {
        *self.inner.on_disconnect.lock() = Some(callback);
    }

    /// Register the verified-reconnect callback.
    pub fn set_reconnect_callback(&self, callback: ReconnectCallback) {
        *self.inner.on_reconnect.lock() = Some(callback);
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnState {
        self.inner.meta.lock().state
    }

    /// Whether the underlying socket is open.
    #[must_use]
    pub fn is_ws_open(&self) -> bool {
        self.inner.ws_open.load(Ordering::Relaxed)
    }

    /// Whether the connected event is set.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected()
    }

    /// Whether the transport is connected and not mid-reconnect.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.connection_info().is_healthy()
    }

    /// Total inbound payloads observed, including discarded oversized ones.
    #[must_use]
    pub fn received_total(&self) -> u64 {
        self.inner.received_total.load(Ordering::Relaxed)
    }

    /// Buffered outbound message count.
    #[must_use]
    pub fn outbound_len(&self) -> usize {
        self.inner.outbound.lock().len()
    }

    /// Point-in-time diagnostics.
    #[must_use]
    pub fn connection_info(&self) -> ConnectionInfo {
        let meta = self.inner.meta.lock();
        ConnectionInfo {
            agent_id: self.inner.agent_id.clone(),
            server_url: self.inner.server_url.clone(),
            state: meta.state,
            ws_open: self.inner.ws_open.load(Ordering::Relaxed),
            is_retrying: meta.is_retrying,
            reconnect_attempts: meta.reconnect_attempts,
            connection_id: meta.connection_id,
            queue_size: self.inner.outbound.lock().len(),
            queue_capacity: self.inner.config.max_queue_size,
            pending_streams: self.inner.waiters.pending_count(),
        }
    }

    /// One-line health summary for logs.
    #[must_use]
    pub fn health_summary(&self) -> String {
        let info = self.connection_info();
        format!(
            "{} | state={} | ws_open={} | retrying={} | queue={}/{}",
            if info.is_healthy() { "healthy" } else { "unhealthy" },
            info.state,
            info.ws_open,
            info.is_retrying,
            info.queue_size,
            info.queue_capacity,
        )
    }

    /// Ensure a connection exists.
    ///
    /// Idempotent: an open socket returns immediately, a concurrent attempt
    /// is awaited, and only a genuinely dead client starts a new attempt.
    pub async fn start(&self) -> Result<(), AcpError> {
        start_connection(&self.inner).await.map_err(AcpError::from)
    }

    /// Send one text frame, establishing the connection if necessary.
    ///
    /// On failure the message is placed in the outbound buffer (oldest
    /// dropped when full) to be drained in order by the next successful
    /// connection. Oversized messages are dropped outright instead.
    pub async fn send(&self, msg: &str) -> Result<(), AcpError> {
        let inner = &self.inner;

        if msg.len() > inner.config.max_message_size {
            error!(
                agent_id = %inner.agent_id,
                size = msg.len(),
                limit = inner.config.max_message_size,
                "outbound message oversized, dropped"
            );
            return Err(TransportError::oversized(msg.len(), inner.config.max_message_size).into());
        }

        if !ensure_connection(inner).await {
            queue_message(inner, msg);
            return Err(TransportError::not_connected().into());
        }

        match send_on_current_sink(inner, msg).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(agent_id = %inner.agent_id, error = %e, "send failed, buffering");
                queue_message(inner, msg);
                Err(e.into())
            }
        }
    }

    /// Wait until the socket is open and the connected event set, polling
    /// every 300 ms up to `timeout`. Used by retrying callers after a drop.
    pub async fn wait_for_ready(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.inner.ws_open.load(Ordering::Relaxed) && self.inner.connected() {
                // A short settle, then re-verify.
                tokio::time::sleep(VERIFY_SETTLE).await;
                if self.inner.ws_open.load(Ordering::Relaxed) {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return self.inner.ws_open.load(Ordering::Relaxed);
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
    }

    /// Graceful shutdown: no further reconnects, socket closed, helper
    /// tasks stopped, pending waiters notified.
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.shutdown.store(true, Ordering::SeqCst);

        {
            let mut sink = inner.sink.lock().await;
            if let Some((_, mut half)) = sink.take() {
                let _ = tokio::time::timeout(Duration::from_secs(1), half.send(Message::Close(None)))
                    .await;
                let _ = tokio::time::timeout(Duration::from_secs(1), half.close()).await;
            }
        }
        inner.ws_open.store(false, Ordering::Relaxed);
        inner.set_connected(false);
        {
            let mut meta = inner.meta.lock();
            meta.state = ConnState::Disconnected;
            meta.connecting_since_ms = 0;
        }
        inner.waiters.notify_all("client stopped");

        let tasks: Vec<JoinHandle<()>> = inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let aborter = task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                debug!(agent_id = %inner.agent_id, "transport task did not exit in time, aborting");
                aborter.abort();
            }
        }
        info!(agent_id = %inner.agent_id, "message client stopped");
    }

    /// Full reset: like [`stop`](Self::stop) but also discards the outbound
    /// buffer and all counters, leaving the instance reusable.
    pub async fn full_reset(&self) {
        info!(agent_id = %self.inner.agent_id, "message client full reset");
        self.inner.waiters.notify_all("client resetting");
        self.stop().await;

        self.inner.outbound.lock().clear();
        {
            let mut meta = self.inner.meta.lock();
            meta.state = ConnState::Disconnected;
            meta.connection_id = 0;
            meta.connecting_since_ms = 0;
            meta.is_retrying = false;
            meta.reconnect_attempts = 0;
            meta.current_backoff = self.inner.config.reconnect_base();
        }
        self.inner.last_pong_ms.store(0, Ordering::Relaxed);
        // Reusable after reset.
        self.inner.shutdown.store(false, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection establishment
// ─────────────────────────────────────────────────────────────────────────────

async fn start_connection(inner: &Arc<Inner>) -> Result<(), TransportError> {
    if inner.shutdown.load(Ordering::Relaxed) {
        return Err(TransportError::connection("client is shut down"));
    }

    let mut need_start = false;
    {
        let mut meta = inner.meta.lock();

        if inner.ws_open.load(Ordering::Relaxed) {
            // The socket is fine; repair a stale state marker if needed.
            if meta.state != ConnState::Connected {
                debug!(
                    conn_id = meta.connection_id,
                    from = %meta.state,
                    "socket open, fixing state to connected"
                );
                meta.state = ConnState::Connected;
                inner.set_connected(true);
            }
            return Ok(());
        }

        let now = unix_millis();
        let stale_after =
            (inner.config.connection_timeout() * 2).max(Duration::from_secs(10));
        #[allow(clippy::cast_possible_truncation)]
        let stale_after_ms = stale_after.as_millis() as u64;

        if meta.state == ConnState::Connecting {
            let elapsed = now.saturating_sub(meta.connecting_since_ms);
            if meta.connecting_since_ms > 0 && elapsed > stale_after_ms {
                warn!(
                    conn_id = meta.connection_id,
                    elapsed_ms = elapsed,
                    "stale connecting state, restarting attempt"
                );
                meta.connection_id += 1;
                meta.connecting_since_ms = now;
                inner.set_connected(false);
                need_start = true;
            } else {
                debug!(conn_id = meta.connection_id, "another task is connecting, waiting");
            }
        } else {
            meta.connection_id += 1;
            info!(
                conn_id = meta.connection_id,
                from = %meta.state,
                server = %inner.server_url,
                "starting connection attempt"
            );
            meta.state = ConnState::Connecting;
            meta.connecting_since_ms = now;
            inner.set_connected(false);
            need_start = true;
        }

        if need_start {
            let conn_id = meta.connection_id;
            drop(meta);
            let handle = tokio::spawn(run_connection(inner.clone(), conn_id));
            let mut tasks = inner.tasks.lock();
            tasks.retain(|task| !task.is_finished());
            tasks.push(handle);
        }
    }

    wait_for_connection(inner).await
}

async fn wait_for_connection(inner: &Arc<Inner>) -> Result<(), TransportError> {
    let mut rx = inner.connected_tx.subscribe();
    let wait = tokio::time::timeout(
        inner.config.connection_timeout(),
        rx.wait_for(|connected| *connected),
    )
    .await;

    match wait {
        Ok(Ok(_)) => Ok(()),
        _ => {
            let mut meta = inner.meta.lock();
            if meta.state == ConnState::Connecting {
                let now = unix_millis();
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = inner.config.connection_timeout().as_millis() as u64;
                if meta.connecting_since_ms > 0
                    && now.saturating_sub(meta.connecting_since_ms) > timeout_ms
                {
                    warn!("connection appears stalled, marking disconnected");
                    meta.state = ConnState::Disconnected;
                    meta.connecting_since_ms = 0;
                    inner.set_connected(false);
                }
            }
            Err(TransportError::timeout("connection not established in time"))
        }
    }
}

async fn run_connection(inner: Arc<Inner>, conn_id: u64) {
    // The transport authenticates itself if the shared token is missing.
    if inner.auth.signature().is_none() {
        if let Err(e) = inner.auth.sign_in(SIGN_IN_RETRIES).await {
            error!(conn_id, error = %e, "sign-in for websocket failed");
            handle_connection_close(&inner, conn_id, None, "sign-in failed").await;
            return;
        }
    }
    let signature = inner.auth.signature().unwrap_or_default();
    let url = build_ws_url(&inner.server_url, &inner.agent_id, &signature);
    debug!(conn_id, "connecting websocket");

    // No protocol-level size limit: oversized frames are handled (discarded)
    // at the application layer so one bad frame cannot kill the channel.
    let ws_config = WebSocketConfig::default()
        .max_message_size(None)
        .max_frame_size(None);

    let connect = tokio::time::timeout(
        inner.config.connection_timeout(),
        connect_async_with_config(url, Some(ws_config), true),
    )
    .await;

    let (ws, _response) = match connect {
        Ok(Ok(ok)) => ok,
        Ok(Err(e)) => {
            let reason = e.to_string();
            if is_rate_limited(&reason) {
                let mut meta = inner.meta.lock();
                meta.current_backoff = widen(
                    meta.current_backoff * 2,
                    1.0,
                    inner.config.reconnect_max(),
                );
                warn!(conn_id, "server rate limited the connection, widening backoff");
            }
            handle_connection_close(&inner, conn_id, None, &reason).await;
            return;
        }
        Err(_) => {
            handle_connection_close(&inner, conn_id, None, "handshake timeout").await;
            return;
        }
    };

    {
        let meta = inner.meta.lock();
        if meta.connection_id != conn_id {
            debug!(conn_id, current = meta.connection_id, "connection superseded, dropping");
            return;
        }
    }

    let (sink_half, stream) = ws.split();
    *inner.sink.lock().await = Some((conn_id, sink_half));
    inner.last_pong_ms.store(unix_millis(), Ordering::Relaxed);

    // Buffered messages go out in FIFO order before the connection is
    // announced, so nothing new can interleave with the backlog.
    drain_outbound(&inner, conn_id).await;

    inner.ws_open.store(true, Ordering::Relaxed);
    {
        let mut meta = inner.meta.lock();
        meta.state = ConnState::Connected;
        meta.connecting_since_ms = 0;
        meta.is_retrying = false;
    }
    inner.set_connected(true);
    info!(conn_id, agent_id = %inner.agent_id, "websocket connection established");

    {
        let mut tasks = inner.tasks.lock();
        tasks.push(tokio::spawn(health_check_task(inner.clone(), conn_id)));
        tasks.push(tokio::spawn(cleaner_task(inner.clone(), conn_id)));
    }

    let on_open = inner.on_open.lock().clone();
    if let Some(callback) = on_open {
        callback();
    }

    let (code, reason) = receive_loop(&inner, conn_id, stream).await;
    handle_connection_close(&inner, conn_id, code, &reason).await;
}

fn is_rate_limited(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    lower.contains("400") || lower.contains("connection limit")
}

// ─────────────────────────────────────────────────────────────────────────────
// Receive path
// ─────────────────────────────────────────────────────────────────────────────

async fn receive_loop(
    inner: &Arc<Inner>,
    conn_id: u64,
    mut stream: WsSource,
) -> (Option<u16>, String) {
    loop {
        if inner.meta.lock().connection_id != conn_id {
            debug!(conn_id, "receive loop superseded, exiting");
            return (None, "superseded".to_owned());
        }

        match stream.next().await {
            Some(Ok(message)) => {
                inner.last_pong_ms.store(unix_millis(), Ordering::Relaxed);
                match message {
                    Message::Text(text) => handle_payload(inner, conn_id, text.as_str()),
                    Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                        Ok(text) => handle_payload(inner, conn_id, text),
                        Err(e) => {
                            let _ = inner.received_total.fetch_add(1, Ordering::Relaxed);
                            warn!(conn_id, error = %e, "undecodable binary frame discarded");
                        }
                    },
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                    Message::Close(frame) => {
                        let (code, reason) = match frame {
                            Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                            None => (None, String::new()),
                        };
                        return (code, reason);
                    }
                }
            }
            Some(Err(e)) => {
                let text = e.to_string();
                // A reserved-bits (or similar) protocol fault on one frame
                // kills the channel; surface it as a synthetic 1006 so the
                // normal close/reconnect path runs.
                if text.to_lowercase().contains("reserved") {
                    warn!(conn_id, error = %text, "reserved-bits protocol error");
                    return (Some(CLOSE_ABNORMAL), "RSV error".to_owned());
                }
                return (None, text);
            }
            None => return (Some(CLOSE_ABNORMAL), "stream ended".to_owned()),
        }
    }
}

fn handle_payload(inner: &Arc<Inner>, conn_id: u64, text: &str) {
    let _ = inner.received_total.fetch_add(1, Ordering::Relaxed);

    if text.len() > inner.config.max_message_size {
        error!(
            conn_id,
            size = text.len(),
            limit = inner.config.max_message_size,
            "oversized inbound message discarded"
        );
        return;
    }

    let callback = inner.on_message.lock().clone();
    if let Some(callback) = callback {
        callback(text);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Send path
// ─────────────────────────────────────────────────────────────────────────────

async fn ensure_connection(inner: &Arc<Inner>) -> bool {
    if inner.ws_open.load(Ordering::Relaxed) {
        let mut meta = inner.meta.lock();
        if meta.state == ConnState::Disconnected {
            meta.state = ConnState::Connected;
            inner.set_connected(true);
        }
        return true;
    }
    for attempt in 0..inner.config.send_retry_attempts {
        if start_connection(inner).await.is_ok() {
            return true;
        }
        if attempt + 1 < inner.config.send_retry_attempts {
            tokio::time::sleep(inner.config.send_retry_delay()).await;
        }
    }
    error!(
        attempts = inner.config.send_retry_attempts,
        "failed to establish connection for send"
    );
    false
}

async fn send_on_current_sink(inner: &Arc<Inner>, msg: &str) -> Result<(), TransportError> {
    let mut guard = inner.sink.lock().await;
    let Some((_, sink)) = guard.as_mut() else {
        return Err(TransportError::not_connected());
    };
    let result = tokio::time::timeout(SEND_TIMEOUT, sink.send(Message::Text(msg.into()))).await;
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            drop(guard);
            mark_disconnected(inner);
            Err(TransportError::connection(e.to_string()))
        }
        Err(_) => Err(TransportError::timeout("send timed out")),
    }
}

fn mark_disconnected(inner: &Arc<Inner>) {
    inner.ws_open.store(false, Ordering::Relaxed);
    let mut meta = inner.meta.lock();
    if meta.state == ConnState::Connected {
        meta.state = ConnState::Disconnected;
    }
    inner.set_connected(false);
}

fn queue_message(inner: &Arc<Inner>, msg: &str) {
    let mut outbound = inner.outbound.lock();
    if outbound.len() >= inner.config.max_queue_size {
        let _ = outbound.pop_front();
    }
    outbound.push_back(msg.to_owned());
    debug!(queued = outbound.len(), "message buffered for reconnect");
}

async fn drain_outbound(inner: &Arc<Inner>, conn_id: u64) {
    loop {
        let msg = {
            let mut outbound = inner.outbound.lock();
            outbound.pop_front()
        };
        let Some(msg) = msg else { break };

        let mut guard = inner.sink.lock().await;
        let owned = matches!(&*guard, Some((id, _)) if *id == conn_id);
        if !owned {
            drop(guard);
            inner.outbound.lock().push_front(msg);
            break;
        }
        let Some((_, sink)) = guard.as_mut() else {
            inner.outbound.lock().push_front(msg);
            break;
        };
        let sent = tokio::time::timeout(SEND_TIMEOUT, sink.send(Message::Text(msg.as_str().into())))
            .await;
        if !matches!(sent, Ok(Ok(()))) {
            drop(guard);
            inner.outbound.lock().push_front(msg);
            warn!(conn_id, "draining buffered messages interrupted");
            break;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Close handling and reconnection
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_connection_close(
    inner: &Arc<Inner>,
    conn_id: u64,
    code: Option<u16>,
    reason: &str,
) {
    let is_current = {
        let mut meta = inner.meta.lock();
        if meta.connection_id == conn_id {
            info!(conn_id, ?code, reason, "current connection closed");
            meta.state = ConnState::Disconnected;
            meta.connecting_since_ms = 0;
            true
        } else {
            debug!(conn_id, current = meta.connection_id, "old connection closed");
            false
        }
    };

    if is_current {
        inner.ws_open.store(false, Ordering::Relaxed);
        inner.set_connected(false);
    }

    {
        let mut sink = inner.sink.lock().await;
        if matches!(&*sink, Some((id, _)) if *id == conn_id) {
            *sink = None;
        }
    }

    // Fail pending stream requests immediately rather than letting them
    // run into their own timeouts.
    inner.waiters.notify_all(reason);

    if !is_current {
        return;
    }

    if code != Some(CLOSE_NORMAL) {
        let callback = inner.on_disconnect.lock().clone();
        if let Some(callback) = callback {
            callback(&inner.agent_id, &inner.server_url, code, reason);
        }
    }

    let abnormal = matches!(code, Some(1006 | 1002) | None)
        || reason.contains("400")
        || reason.to_lowercase().contains("protocol");
    if abnormal {
        let mut meta = inner.meta.lock();
        meta.reconnect_attempts = 0;
        meta.current_backoff = inner.config.reconnect_base();
    }

    if !inner.shutdown.load(Ordering::Relaxed)
        && inner.config.auto_reconnect
        && code != Some(CLOSE_NORMAL)
    {
        let spawn = {
            let meta = inner.meta.lock();
            !meta.is_retrying
        };
        if spawn {
            let worker = inner.clone();
            let handle = tokio::spawn(async move {
                // Let the closing connection finish tearing down first.
                tokio::time::sleep(RECONNECT_SPAWN_DELAY).await;
                reconnect_worker(&worker).await;
            });
            inner.tasks.lock().push(handle);
        }
    }
}

fn reconnect_worker(inner: &Arc<Inner>) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
    Box::pin(async move {
        {
            let mut meta = inner.meta.lock();
            if meta.is_retrying {
                debug!("reconnect already in progress");
                return;
            }
            meta.is_retrying = true;
            if meta.state == ConnState::Disconnected {
                meta.state = ConnState::Reconnecting;
            }
        }

        while !inner.shutdown.load(Ordering::Relaxed) {
            let (attempt, backoff) = {
                let mut meta = inner.meta.lock();
                meta.reconnect_attempts += 1;
                (meta.reconnect_attempts, meta.current_backoff)
            };
            if attempt == 1 || attempt % 10 == 0 {
                info!(attempt, ?backoff, "reconnecting");
            } else {
                debug!(attempt, "reconnecting");
            }

            if start_connection(inner).await.is_ok() {
                // Verify the connection is genuinely usable after a settle.
                tokio::time::sleep(VERIFY_SETTLE).await;
                if verify_connection(inner) {
                    recovery_pass(inner);
                    let callback = inner.on_reconnect.lock().clone();
                    if let Some(callback) = callback {
                        callback(&inner.agent_id, &inner.server_url);
                    }
                    let mut meta = inner.meta.lock();
                    meta.reconnect_attempts = 0;
                    meta.current_backoff = inner.config.reconnect_base();
                    meta.is_retrying = false;
                    info!("reconnection successful");
                    return;
                }
                warn!("reconnect verification failed, retrying");
            }

            tokio::time::sleep(backoff).await;
            {
                let mut meta = inner.meta.lock();
                meta.current_backoff = widen(
                    meta.current_backoff,
                    inner.config.reconnect_backoff_factor,
                    inner.config.reconnect_max(),
                );
            }
        }

        let mut meta = inner.meta.lock();
        meta.is_retrying = false;
        if meta.state != ConnState::Connected {
            meta.state = ConnState::Disconnected;
        }
    })
}

fn verify_connection(inner: &Arc<Inner>) -> bool {
    let ws_open = inner.ws_open.load(Ordering::Relaxed);
    let connected = inner.connected();
    let state_ok = inner.meta.lock().state == ConnState::Connected;
    if !(ws_open && connected && state_ok) {
        debug!(ws_open, connected, state_ok, "connection verification failed");
        return false;
    }
    true
}

/// Post-reconnect recovery: report the state background tasks depend on.
fn recovery_pass(inner: &Arc<Inner>) {
    let queued = inner.outbound.lock().len();
    let pending = inner.waiters.pending_count();
    info!(
        queued,
        pending_streams = pending,
        "system recovery check after reconnect"
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Watchdog tasks
// ─────────────────────────────────────────────────────────────────────────────

async fn health_check_task(inner: Arc<Inner>, conn_id: u64) {
    let interval = inner.config.health_check_interval();
    let mut elapsed = Duration::ZERO;
    debug!(conn_id, interval_secs = interval.as_secs(), "health check started");

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if inner.shutdown.load(Ordering::Relaxed) {
            break;
        }
        if inner.meta.lock().connection_id != conn_id {
            debug!(conn_id, "health check superseded, exiting");
            break;
        }
        elapsed += Duration::from_secs(1);
        if elapsed < interval {
            continue;
        }
        elapsed = Duration::ZERO;

        let state = inner.meta.lock().state;
        let ws_open = inner.ws_open.load(Ordering::Relaxed);
        if state == ConnState::Disconnected || !ws_open {
            warn!(conn_id, %state, ws_open, "health check found dead connection");
            inner.waiters.notify_all("health check found connection down");
            mark_disconnected(&inner);
            let spawn = !inner.meta.lock().is_retrying;
            if spawn {
                let worker = inner.clone();
                let handle = tokio::spawn(async move { reconnect_worker(&worker).await });
                inner.tasks.lock().push(handle);
            }
            continue;
        }
        inner.last_pong_ms.store(unix_millis(), Ordering::Relaxed);
    }
}

async fn cleaner_task(inner: Arc<Inner>, conn_id: u64) {
    let mut elapsed = Duration::ZERO;
    debug!(conn_id, "stale-stream cleaner started");

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if inner.shutdown.load(Ordering::Relaxed) {
            break;
        }
        if inner.meta.lock().connection_id != conn_id {
            debug!(conn_id, "cleaner superseded, exiting");
            break;
        }
        elapsed += Duration::from_secs(1);
        if elapsed < CLEANER_INTERVAL {
            continue;
        }
        elapsed = Duration::ZERO;

        let dropped = inner.waiters.drop_stale(STALE_STREAM_AGE_MS);
        if dropped > 0 {
            info!(conn_id, dropped, "stale stream requests cleaned");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use acp_core::paths::IdentityPaths;

    use super::*;

    fn test_client(config: TransportConfig) -> MessageClient {
        let paths = IdentityPaths::new("/tmp/acp-mc-test", "/tmp/acp-mc-test/certs", "a.corp.example");
        let auth = Arc::new(AuthClient::new(
            "a.corp.example",
            "https://msg.corp.example",
            paths,
            "pass",
        ));
        MessageClient::new("a.corp.example", "https://msg.corp.example", auth, config)
    }

    #[test]
    fn ws_url_scheme_and_params() {
        let url = build_ws_url("https://msg.corp.example/", "a.corp.example", "tok");
        assert_eq!(
            url,
            "wss://msg.corp.example/session?agent_id=a.corp.example&signature=tok"
        );
        let plain = build_ws_url("http://localhost:9000", "a.corp.example", "tok");
        assert!(plain.starts_with("ws://localhost:9000/session?"));
    }

    #[test]
    fn initial_state_disconnected() {
        let client = test_client(TransportConfig::default());
        assert_eq!(client.connection_state(), ConnState::Disconnected);
        assert!(!client.is_ws_open());
        assert!(!client.is_healthy());
        assert_eq!(client.outbound_len(), 0);
    }

    #[test]
    fn queue_drops_oldest_when_full() {
        let config = TransportConfig {
            max_queue_size: 3,
            ..Default::default()
        };
        let client = test_client(config);
        for i in 0..5 {
            queue_message(&client.inner, &format!("m{i}"));
        }
        let buffered: Vec<String> = client.inner.outbound.lock().iter().cloned().collect();
        assert_eq!(buffered, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn oversized_send_is_dropped_not_queued() {
        let config = TransportConfig {
            max_message_size: 16,
            send_retry_attempts: 1,
            ..Default::default()
        };
        let client = test_client(config);
        let err = client.send(&"x".repeat(32)).await.unwrap_err();
        assert_eq!(err.code(), "TRANSPORT_OVERSIZED");
        assert_eq!(client.outbound_len(), 0);
    }

    #[test]
    fn oversized_inbound_discarded_but_counted() {
        let config = TransportConfig {
            max_message_size: 8,
            ..Default::default()
        };
        let client = test_client(config);
        let delivered = Arc::new(AtomicU64::new(0));
        let delivered2 = delivered.clone();
        client.set_message_callback(Arc::new(move |_| {
            let _ = delivered2.fetch_add(1, Ordering::Relaxed);
        }));

        // Simulate the receive task handing over payloads.
        client.inner.ws_open.store(true, Ordering::Relaxed);
        handle_payload(&client.inner, 1, &"y".repeat(64));
        handle_payload(&client.inner, 1, "ok");

        assert_eq!(client.received_total(), 2);
        assert_eq!(delivered.load(Ordering::Relaxed), 1);
        // The connection is untouched.
        assert!(client.is_ws_open());
    }

    #[test]
    fn rate_limit_detection() {
        assert!(is_rate_limited("HTTP error: 400 Bad Request"));
        assert!(is_rate_limited("exceeded Connection Limit"));
        assert!(!is_rate_limited("connection refused"));
    }

    #[test]
    fn verify_connection_needs_all_flags() {
        let client = test_client(TransportConfig::default());
        assert!(!verify_connection(&client.inner));
        client.inner.ws_open.store(true, Ordering::Relaxed);
        client.inner.set_connected(true);
        client.inner.meta.lock().state = ConnState::Connected;
        assert!(verify_connection(&client.inner));
    }

    #[tokio::test]
    async fn full_reset_leaves_reusable_state() {
        let client = test_client(TransportConfig::default());
        queue_message(&client.inner, "m1");
        {
            let mut meta = client.inner.meta.lock();
            meta.connection_id = 7;
            meta.reconnect_attempts = 4;
        }
        client.full_reset().await;

        assert_eq!(client.outbound_len(), 0);
        let info = client.connection_info();
        assert_eq!(info.connection_id, 0);
        assert_eq!(info.reconnect_attempts, 0);
        assert_eq!(info.state, ConnState::Disconnected);
        assert!(!client.inner.shutdown.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn close_notifies_stream_waiters() {
        let client = test_client(TransportConfig::default());
        let mut rx = client.waiters().register("r1", "b.corp.example");
        client.inner.meta.lock().connection_id = 1;

        handle_connection_close(&client.inner, 1, Some(1006), "socket reset").await;

        let signal = rx.recv().await.unwrap();
        assert_matches::assert_matches!(
            signal,
            crate::waiters::StreamSignal::ConnectionLost { message } if message.contains("socket reset")
        );
        // Abort the spawned reconnect worker.
        client.inner.shutdown.store(true, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn disconnect_callback_only_on_abnormal_close() {
        let client = test_client(TransportConfig {
            auto_reconnect: false,
            ..Default::default()
        });
        let calls = Arc::new(AtomicU64::new(0));
        let calls2 = calls.clone();
        client.set_disconnect_callback(Arc::new(move |_, _, _, _| {
            let _ = calls2.fetch_add(1, Ordering::Relaxed);
        }));

        client.inner.meta.lock().connection_id = 1;
        handle_connection_close(&client.inner, 1, Some(1000), "bye").await;
        assert_eq!(calls.load(Ordering::Relaxed), 0);

        client.inner.meta.lock().connection_id = 2;
        handle_connection_close(&client.inner, 2, Some(1006), "gone").await;
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn superseded_close_does_not_touch_current_state() {
        let client = test_client(TransportConfig::default());
        {
            let mut meta = client.inner.meta.lock();
            meta.connection_id = 5;
            meta.state = ConnState::Connected;
        }
        client.inner.ws_open.store(true, Ordering::Relaxed);

        handle_connection_close(&client.inner, 4, Some(1006), "old conn").await;

        assert_eq!(client.connection_state(), ConnState::Connected);
        assert!(client.is_ws_open());
    }
}
