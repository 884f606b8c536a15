//! # acp-heartbeat
//!
//! UDP heartbeat transport. Two cooperating loops keep the identity visible
//! to its authority: the send loop emits a heartbeat record every interval
//! and watches for missing acknowledgements, the receive loop decodes
//! acknowledgements (which may adjust the interval) and inbound session
//! invites. Reconnection replaces the socket and re-signs-in without taking
//! the client offline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use acp_auth::AuthClient;
use acp_core::blocks::unix_millis;
use acp_core::errors::{AcpError, TransportError};
use acp_wire::heartbeat::{
    HeartbeatRequest, InviteAck, InviteRequest, NEXT_BEAT_AUTH_STALE, UdpRecord, decode_datagram,
};

/// Consecutive send failures that trigger a reconnect.
const MAX_SEND_FAILURES: u32 = 3;
/// Consecutive receive failures that trigger a reconnect.
const MAX_RECV_FAILURES: u32 = 3;
/// Missed acknowledgement intervals that trigger a reconnect.
const MAX_MISSED_HEARTBEATS: u64 = 3;
/// Send-failure backoff cap.
const SEND_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Minimum spacing between reconnect attempts.
const RECONNECT_MIN_SPACING_MS: u64 = 5000;
/// Socket receive timeout; bounds how fast shutdown is observed.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(1);
/// Lower bound on the server-adjustable heartbeat interval.
const INTERVAL_FLOOR_MS: u64 = 5000;
/// Sign-in retry budget used by connect and reconnect.
const SIGN_IN_RETRIES: u32 = 10;

/// Callback invoked for each inbound session invite.
pub type InviteCallback = Arc<dyn Fn(InviteRequest) + Send + Sync>;

/// Whether the ack watchdog considers the peer gone.
///
/// True once `now - last_recv` exceeds `MAX_MISSED_HEARTBEATS × interval`.
#[must_use]
pub fn ack_watchdog_expired(now_ms: u64, last_recv_ms: u64, interval_ms: u64) -> bool {
    last_recv_ms > 0 && now_ms.saturating_sub(last_recv_ms) > MAX_MISSED_HEARTBEATS * interval_ms
}

struct Shared {
    agent_id: String,
    auth: Arc<AuthClient>,
    running: AtomicBool,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    reconnect_gate: tokio::sync::Mutex<()>,
    endpoint: Mutex<Option<SocketAddr>>,
    sign_cookie: AtomicU32,
    msg_seq: AtomicU32,
    interval_ms: AtomicU64,
    last_sent_ms: AtomicU64,
    last_recv_ms: AtomicU64,
    last_reconnect_ms: AtomicU64,
    send_failures: AtomicU32,
    recv_failures: AtomicU32,
    reconnects: AtomicU64,
    on_invite: Mutex<Option<InviteCallback>>,
}

impl Shared {
    fn next_seq(&self) -> u32 {
        self.msg_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().clone()
    }

    fn interval_ms(&self) -> u64 {
        self.interval_ms.load(Ordering::Relaxed)
    }

    fn set_interval_ms(&self, value: u64) {
        self.interval_ms
            .store(value.max(INTERVAL_FLOOR_MS), Ordering::Relaxed);
    }

    async fn send_record(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let Some(addr) = *self.endpoint.lock() else {
            return Err(TransportError::not_connected());
        };
        let Some(socket) = self.socket() else {
            return Err(TransportError::not_connected());
        };
        let _ = socket
            .send_to(bytes, addr)
            .await
            .map_err(|e| TransportError::connection(e.to_string()).with_source(e))?;
        Ok(())
    }
}

/// UDP heartbeat client for one identity.
pub struct HeartbeatClient {
    shared: Arc<Shared>,
    cancel: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HeartbeatClient {
    /// Create a client signing in through `auth`.
    #[must_use]
    pub fn new(agent_id: &str, auth: Arc<AuthClient>) -> Self {
        Self {
            shared: Arc::new(Shared {
                agent_id: agent_id.to_owned(),
                auth,
                running: AtomicBool::new(false),
                socket: Mutex::new(None),
                reconnect_gate: tokio::sync::Mutex::new(()),
                endpoint: Mutex::new(None),
                sign_cookie: AtomicU32::new(0),
                msg_seq: AtomicU32::new(0),
                interval_ms: AtomicU64::new(INTERVAL_FLOOR_MS),
                last_sent_ms: AtomicU64::new(0),
                last_recv_ms: AtomicU64::new(0),
                last_reconnect_ms: AtomicU64::new(0),
                send_failures: AtomicU32::new(0),
                recv_failures: AtomicU32::new(0),
                reconnects: AtomicU64::new(0),
                on_invite: Mutex::new(None),
            }),
            cancel: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register the invite callback; replaces any previous one.
    pub fn set_on_invite(&self, callback: InviteCallback) {
        *self.shared.on_invite.lock() = Some(callback);
    }

    /// Whether the loops are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    /// Current heartbeat interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.shared.interval_ms())
    }

    /// Total reconnects performed since construction.
    #[must_use]
    pub fn reconnect_count(&self) -> u64 {
        self.shared.reconnects.load(Ordering::Relaxed)
    }

    /// Sign in and start the send and receive loops.
    ///
    /// Idempotent: a second call while running returns immediately.
    pub async fn online(&self) -> Result<(), AcpError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = sign_in_endpoint(&self.shared).await {
            self.shared.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        if let Err(e) = open_socket(&self.shared).await {
            self.shared.running.store(false, Ordering::SeqCst);
            return Err(AcpError::from(e));
        }
        self.shared
            .last_recv_ms
            .store(unix_millis(), Ordering::Relaxed);

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(send_loop(self.shared.clone(), cancel.clone())));
        tasks.push(tokio::spawn(recv_loop(self.shared.clone(), cancel)));
        info!(agent_id = %self.shared.agent_id, "heartbeat online");
        Ok(())
    }

    /// Stop both loops, close the socket, and sign out is left to the caller.
    pub async fn offline(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel.lock().cancel();
        *self.shared.socket.lock() = None;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(3), task)
                .await
                .is_err()
            {
                warn!(agent_id = %self.shared.agent_id, "heartbeat loop did not exit in time");
            }
        }
        info!(agent_id = %self.shared.agent_id, "heartbeat offline");
    }

    /// Best-effort sign-out on the shared auth client.
    pub async fn sign_out(&self) {
        self.shared.auth.sign_out().await;
    }
}

async fn sign_in_endpoint(shared: &Arc<Shared>) -> Result<(), AcpError> {
    let info = shared.auth.sign_in(SIGN_IN_RETRIES).await?;
    let (Some(ip), Some(port)) = (info.server_ip.clone(), info.port) else {
        return Err(AcpError::internal(
            "AUTH_ENDPOINT_MISSING",
            "sign-in response carried no heartbeat endpoint",
        ));
    };
    let port = u16::try_from(port)
        .map_err(|_| AcpError::internal("AUTH_ENDPOINT_MISSING", "heartbeat port out of range"))?;
    let addr: SocketAddr = format!("{ip}:{port}")
        .parse()
        .map_err(|_| AcpError::internal("AUTH_ENDPOINT_MISSING", "heartbeat endpoint unparsable"))?;
    *shared.endpoint.lock() = Some(addr);
    shared
        .sign_cookie
        .store(info.sign_cookie.unwrap_or(0), Ordering::Relaxed);
    info!(agent_id = %shared.agent_id, %addr, "heartbeat endpoint resolved");
    Ok(())
}

async fn open_socket(shared: &Arc<Shared>) -> Result<(), TransportError> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| TransportError::connection(e.to_string()).with_source(e))?;
    if let Ok(local) = socket.local_addr() {
        debug!(agent_id = %shared.agent_id, %local, "udp socket bound");
    }
    *shared.socket.lock() = Some(Arc::new(socket));
    Ok(())
}

/// Replace the socket after a fresh sign-in; serialised and rate limited.
async fn reconnect(shared: &Arc<Shared>, reason: &str) -> bool {
    if !shared.running.load(Ordering::Relaxed) {
        debug!(reason, "heartbeat reconnect skipped, client offline");
        return false;
    }
    let Ok(_gate) = shared.reconnect_gate.try_lock() else {
        debug!(reason, "heartbeat reconnect already in progress");
        return false;
    };

    let now = unix_millis();
    let elapsed = now.saturating_sub(shared.last_reconnect_ms.load(Ordering::Relaxed));
    if elapsed < RECONNECT_MIN_SPACING_MS {
        let wait = RECONNECT_MIN_SPACING_MS - elapsed;
        info!(reason, wait_ms = wait, "heartbeat reconnect rate limited");
        tokio::time::sleep(Duration::from_millis(wait)).await;
    }

    info!(agent_id = %shared.agent_id, reason, "heartbeat reconnecting");
    shared.last_reconnect_ms.store(unix_millis(), Ordering::Relaxed);

    if let Err(e) = sign_in_endpoint(shared).await {
        error!(agent_id = %shared.agent_id, error = %e, "heartbeat reconnect sign-in failed");
        return false;
    }
    if let Err(e) = open_socket(shared).await {
        error!(agent_id = %shared.agent_id, error = %e, "heartbeat reconnect socket failed");
        return false;
    }

    shared.send_failures.store(0, Ordering::Relaxed);
    shared.recv_failures.store(0, Ordering::Relaxed);
    shared.last_recv_ms.store(unix_millis(), Ordering::Relaxed);
    let _ = shared.reconnects.fetch_add(1, Ordering::Relaxed);
    info!(agent_id = %shared.agent_id, "heartbeat reconnect successful");
    true
}

async fn send_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut backoff = Duration::from_secs(1);

    loop {
        if cancel.is_cancelled() || !shared.running.load(Ordering::Relaxed) {
            break;
        }

        let now = unix_millis();

        if ack_watchdog_expired(
            now,
            shared.last_recv_ms.load(Ordering::Relaxed),
            shared.interval_ms(),
        ) {
            warn!(agent_id = %shared.agent_id, "heartbeat ack watchdog expired");
            let _ = reconnect(&shared, "heartbeat_response_timeout").await;
            backoff = Duration::from_secs(1);
            continue;
        }

        if now > shared.last_sent_ms.load(Ordering::Relaxed) + shared.interval_ms() {
            shared.last_sent_ms.store(now, Ordering::Relaxed);
            let request = HeartbeatRequest {
                seq: shared.next_seq(),
                agent_id: shared.agent_id.clone(),
                sign_cookie: shared.sign_cookie.load(Ordering::Relaxed),
            };
            match shared.send_record(&request.encode()).await {
                Ok(()) => {
                    shared.send_failures.store(0, Ordering::Relaxed);
                    backoff = Duration::from_secs(1);
                    debug!(agent_id = %shared.agent_id, seq = request.seq, "heartbeat sent");
                }
                Err(e) => {
                    let failures = shared.send_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    error!(agent_id = %shared.agent_id, failures, error = %e, "heartbeat send failed");
                    if failures >= MAX_SEND_FAILURES {
                        let _ = reconnect(&shared, "send_failures_threshold").await;
                        backoff = Duration::from_secs(1);
                    } else {
                        tokio::select! {
                            () = tokio::time::sleep(backoff) => {}
                            () = cancel.cancelled() => break,
                        }
                        backoff = (backoff * 2).min(SEND_BACKOFF_CAP);
                    }
                    continue;
                }
            }
        }

        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(1)) => {}
            () = cancel.cancelled() => break,
        }
    }
    debug!(agent_id = %shared.agent_id, "heartbeat send loop stopped");
}

async fn recv_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut buf = vec![0u8; 1536];

    loop {
        if cancel.is_cancelled() || !shared.running.load(Ordering::Relaxed) {
            break;
        }

        let socket = match shared.socket() {
            Some(socket) => socket,
            None => {
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(500)) => {}
                    () = cancel.cancelled() => break,
                }
                continue;
            }
        };

        let received = tokio::select! {
            result = tokio::time::timeout(SOCKET_TIMEOUT, socket.recv_from(&mut buf)) => result,
            () = cancel.cancelled() => break,
        };
        let Ok(result) = received else {
            // Socket timeout: normal, re-check the running flag.
            continue;
        };
        let (len, _addr) = match result {
            Ok(ok) => ok,
            Err(e) => {
                if !shared.running.load(Ordering::Relaxed) {
                    break;
                }
                let failures = shared.recv_failures.fetch_add(1, Ordering::Relaxed) + 1;
                error!(agent_id = %shared.agent_id, failures, error = %e, "heartbeat recv failed");
                if failures >= MAX_RECV_FAILURES {
                    let _ = reconnect(&shared, "recv_failures_threshold").await;
                } else {
                    tokio::time::sleep(Duration::from_millis(1500)).await;
                }
                continue;
            }
        };
        shared.recv_failures.store(0, Ordering::Relaxed);

        match decode_datagram(&buf[..len]) {
            Ok(UdpRecord::HeartbeatAck(ack)) => {
                shared.last_recv_ms.store(unix_millis(), Ordering::Relaxed);
                if ack.next_beat == NEXT_BEAT_AUTH_STALE {
                    warn!(agent_id = %shared.agent_id, "heartbeat ack reports stale sign-in");
                    let _ = reconnect(&shared, "401_auth_failed").await;
                    continue;
                }
                shared.set_interval_ms(u64::from(ack.next_beat));
            }
            Ok(UdpRecord::InviteRequest(invite)) => {
                info!(
                    agent_id = %shared.agent_id,
                    session_id = %invite.session_id,
                    inviter = %invite.inviter_id,
                    "session invite received"
                );
                let ack = InviteAck {
                    seq: shared.next_seq(),
                    agent_id: shared.agent_id.clone(),
                    inviter_id: invite.inviter_id.clone(),
                    sign_cookie: shared.sign_cookie.load(Ordering::Relaxed),
                };
                let callback = shared.on_invite.lock().clone();
                if let Some(callback) = callback {
                    callback(invite);
                }
                if let Err(e) = shared.send_record(&ack.encode()).await {
                    warn!(agent_id = %shared.agent_id, error = %e, "invite ack send failed");
                }
            }
            Ok(record) => debug!(?record, "unexpected heartbeat record ignored"),
            Err(e) => warn!(error = %e, "undecodable heartbeat datagram dropped"),
        }
    }
    debug!(agent_id = %shared.agent_id, "heartbeat recv loop stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use acp_core::paths::IdentityPaths;
    use acp_wire::heartbeat::HeartbeatAck;

    use super::*;

    fn test_client() -> HeartbeatClient {
        let paths = IdentityPaths::new("/tmp/acp-hb-test", "/tmp/acp-hb-test/certs", "a.corp.example");
        let auth = Arc::new(AuthClient::new(
            "a.corp.example",
            "https://auth.corp.example",
            paths,
            "pass",
        ));
        HeartbeatClient::new("a.corp.example", auth)
    }

    #[test]
    fn watchdog_math() {
        // interval 5000 ms, threshold 3 → expired strictly after 15 000 ms
        assert!(!ack_watchdog_expired(15_000, 1, 5000));
        assert!(ack_watchdog_expired(15_002, 1, 5000));
        // last_recv == 0 means "never", never expires
        assert!(!ack_watchdog_expired(1_000_000, 0, 5000));
    }

    #[test]
    fn interval_floor_applies() {
        let client = test_client();
        client.shared.set_interval_ms(100);
        assert_eq!(client.interval(), Duration::from_millis(5000));
        client.shared.set_interval_ms(8000);
        assert_eq!(client.interval(), Duration::from_millis(8000));
    }

    #[test]
    fn seq_increments() {
        let client = test_client();
        assert_eq!(client.shared.next_seq(), 1);
        assert_eq!(client.shared.next_seq(), 2);
    }

    #[tokio::test]
    async fn offline_without_online_is_noop() {
        let client = test_client();
        client.offline().await;
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn recv_loop_processes_ack_and_invite() {
        let client = test_client();
        let shared = client.shared.clone();

        // Stand in for the heartbeat server.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        *shared.endpoint.lock() = Some(server_addr);
        open_socket(&shared).await.unwrap();
        shared.running.store(true, Ordering::SeqCst);

        let (invite_tx, mut invite_rx) = tokio::sync::mpsc::unbounded_channel();
        client.set_on_invite(Arc::new(move |invite| {
            let _ = invite_tx.send(invite);
        }));

        let cancel = CancellationToken::new();
        let recv_task = tokio::spawn(recv_loop(shared.clone(), cancel.clone()));

        let client_addr = {
            let socket = shared.socket().unwrap();
            socket.local_addr().unwrap()
        };

        // Ack adjusting the interval (below floor, so clamped).
        let ack = HeartbeatAck { seq: 1, next_beat: 6000 };
        let _ = server.send_to(&ack.encode(), client_addr).await.unwrap();

        // Invite record.
        let invite = InviteRequest {
            seq: 2,
            session_id: "sess-1".into(),
            inviter_id: "b.corp.example".into(),
            invite_code: "c0de".into(),
            message_server: "https://msg.corp.example".into(),
        };
        let _ = server.send_to(&invite.encode(), client_addr).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), invite_rx.recv())
            .await
            .expect("invite not delivered")
            .unwrap();
        assert_eq!(received.session_id, "sess-1");
        assert_eq!(shared.interval_ms(), 6000);

        // The invite must be acked with type 516.
        let mut buf = [0u8; 256];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), server.recv_from(&mut buf))
            .await
            .expect("no invite ack")
            .unwrap();
        assert_matches::assert_matches!(
            decode_datagram(&buf[..len]).unwrap(),
            UdpRecord::InviteAck(ack) if ack.inviter_id == "b.corp.example"
        );

        cancel.cancel();
        shared.running.store(false, Ordering::SeqCst);
        let _ = recv_task.await;
    }

    #[tokio::test]
    async fn send_loop_emits_heartbeat() {
        let client = test_client();
        let shared = client.shared.clone();

        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        *shared.endpoint.lock() = Some(server_addr);
        open_socket(&shared).await.unwrap();
        shared.running.store(true, Ordering::SeqCst);
        shared.last_recv_ms.store(unix_millis(), Ordering::Relaxed);
        shared.sign_cookie.store(77, Ordering::Relaxed);

        let cancel = CancellationToken::new();
        let send_task = tokio::spawn(send_loop(shared.clone(), cancel.clone()));

        let mut buf = [0u8; 256];
        let (len, _) = tokio::time::timeout(Duration::from_secs(3), server.recv_from(&mut buf))
            .await
            .expect("no heartbeat sent")
            .unwrap();
        assert_matches::assert_matches!(
            decode_datagram(&buf[..len]).unwrap(),
            UdpRecord::HeartbeatRequest(req) if req.agent_id == "a.corp.example" && req.sign_cookie == 77
        );

        cancel.cancel();
        shared.running.store(false, Ordering::SeqCst);
        let _ = send_task.await;
    }

    #[test]
    fn stale_sentinel_constant() {
        assert_eq!(NEXT_BEAT_AUTH_STALE, 401);
    }
}
