//! End-to-end session flows against a local stand-in server.
//!
//! One listener plays both roles of an authority message server: HTTP POSTs
//! (`/sign_in`) get a canned two-phase challenge, WebSocket upgrades on
//! `/session` run a scripted session server. Credentials on disk are a real
//! P-256 key (unencrypted PKCS#8, exercising the compatibility load path)
//! plus a placeholder certificate, which the client ships verbatim.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use p256::ecdsa::SigningKey;
use pkcs8::{EncodePrivateKey, LineEnding};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use acp_core::blocks::{Block, decode_envelope};
use acp_core::config::TransportConfig;
use acp_core::paths::IdentityPaths;
use acp_session::SessionManager;
use acp_store::Store;
use acp_transport::MessageClient;
use acp_wire::commands::{
    CMD_CREATE_SESSION_ACK, CMD_CREATE_SESSION_REQ, CMD_INVITE_AGENT_REQ, CMD_SESSION_MESSAGE,
    WsFrame,
};

const AGENT: &str = "a.corp.example";

fn write_credentials(paths: &IdentityPaths) {
    paths.ensure_directories().unwrap();
    let key = SigningKey::from_slice(&[7u8; 32]).unwrap();
    let pem = key.to_pkcs8_pem(LineEnding::LF).unwrap();
    std::fs::write(paths.key_path(), pem.as_bytes()).unwrap();
    std::fs::write(
        paths.cert_path(),
        "-----BEGIN CERTIFICATE-----\nZHVtbXk=\n-----END CERTIFICATE-----\n",
    )
    .unwrap();
}

async fn answer_sign_in(mut stream: TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    // Read headers, then the JSON body per Content-Length.
    let body_start = loop {
        let n = stream.read(&mut chunk).await.unwrap();
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let headers = String::from_utf8_lossy(&buf[..body_start]).to_string();
    let content_length: usize = headers
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0);
    while buf.len() < body_start + content_length {
        let n = stream.read(&mut chunk).await.unwrap();
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[body_start..]).to_string();

    let payload = if body.contains("\"nonce\"") {
        r#"{"signature":"test-token"}"#
    } else {
        r#"{"nonce":"nonce-1"}"#
    };
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
        payload.len()
    );
    stream.write_all(response.as_bytes()).await.unwrap();
    stream.shutdown().await.ok();
}

async fn classify(stream: &TcpStream) -> &'static str {
    let mut peeked = [0u8; 4];
    let _ = stream.peek(&mut peeked).await.unwrap();
    if &peeked == b"POST" { "http" } else { "ws" }
}

#[tokio::test]
async fn owner_create_invite_send_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let paths = IdentityPaths::new(dir.path(), dir.path().join("certs"), AGENT);
    write_credentials(&paths);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (frames_tx, frames_rx) = tokio::sync::oneshot::channel::<Vec<WsFrame>>();

    let server = tokio::spawn(async move {
        let mut frames_tx = Some(frames_tx);
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            match classify(&stream).await {
                "http" => {
                    let _ = tokio::spawn(answer_sign_in(stream));
                }
                _ => {
                    let Some(tx) = frames_tx.take() else { continue };
                    let _ = tokio::spawn(async move {
                        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                        let mut seen = Vec::new();
                        while let Some(Ok(msg)) = ws.next().await {
                            let Message::Text(text) = msg else { continue };
                            let frame = WsFrame::parse(text.as_str()).unwrap();
                            if frame.cmd == CMD_CREATE_SESSION_REQ {
                                let request_id = frame.data["request_id"].clone();
                                seen.push(frame);
                                let ack = serde_json::json!({
                                    "cmd": CMD_CREATE_SESSION_ACK,
                                    "data": {
                                        "request_id": request_id,
                                        "session_id": "sess-42",
                                        "identifying_code": "code-7",
                                        "status_code": 200,
                                        "message": "ok"
                                    }
                                });
                                ws.send(Message::Text(ack.to_string().into())).await.unwrap();
                            } else {
                                let done = frame.cmd == CMD_SESSION_MESSAGE;
                                seen.push(frame);
                                if done {
                                    break;
                                }
                            }
                        }
                        let _ = tx.send(seen);
                    });
                }
            }
        }
    });

    let store = Arc::new(Store::in_memory(AGENT).unwrap());
    let manager = SessionManager::new(
        AGENT,
        &format!("http://{addr}"),
        paths,
        "pass",
        TransportConfig {
            auto_reconnect: false,
            ..Default::default()
        },
        store,
    );

    let session = manager.create_session("t", "", "public").await.unwrap();
    assert_eq!(session.session_id(), "sess-42");
    assert!(session.is_owner());

    session.invite_member("b.corp.example").await.unwrap();
    let message_id = manager
        .send_msg(
            "sess-42",
            &[Block::content("hello")],
            "b.corp.example",
            "",
            "",
            None,
        )
        .await
        .unwrap();
    assert!(!message_id.is_empty());

    let frames = tokio::time::timeout(Duration::from_secs(5), frames_rx)
        .await
        .expect("server did not finish")
        .unwrap();
    server.abort();

    // The server observes create, invite, then the message, in order.
    assert_eq!(frames[0].cmd, CMD_CREATE_SESSION_REQ);
    assert_eq!(frames[1].cmd, CMD_INVITE_AGENT_REQ);
    assert_eq!(frames[1].data["acceptor_id"], "b.corp.example");
    assert_eq!(frames[1].data["invite_code"], "code-7");
    assert_eq!(frames[2].cmd, CMD_SESSION_MESSAGE);
    assert_eq!(frames[2].data["receiver"], "b.corp.example");
    assert_eq!(frames[2].data["sender"], AGENT);

    // The envelope decodes back to the content block that was sent.
    let blocks = decode_envelope(frames[2].data["message"].as_str().unwrap()).unwrap();
    assert_eq!(blocks.len(), 1);
    match &blocks[0] {
        Block::Content { content, status, .. } => {
            assert_eq!(content, "hello");
            assert_eq!(status, "success");
        }
        other => panic!("unexpected block {other:?}"),
    }
}

#[tokio::test]
async fn buffered_sends_drain_in_order_after_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let paths = IdentityPaths::new(dir.path(), dir.path().join("certs"), AGENT);
    write_credentials(&paths);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_ws = Arc::new(AtomicBool::new(false));
    let accept_ws_server = accept_ws.clone();
    let (order_tx, order_rx) = tokio::sync::oneshot::channel::<Vec<String>>();

    let server = tokio::spawn(async move {
        let mut order_tx = Some(order_tx);
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            match classify(&stream).await {
                "http" => {
                    let _ = tokio::spawn(answer_sign_in(stream));
                }
                _ if !accept_ws_server.load(Ordering::SeqCst) => {
                    // Socket refused at the WebSocket layer: plain HTTP 503.
                    let _ = stream
                        .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n")
                        .await;
                    let _ = stream.shutdown().await;
                }
                _ => {
                    let Some(tx) = order_tx.take() else { continue };
                    let _ = tokio::spawn(async move {
                        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                        let mut received = Vec::new();
                        while let Some(Ok(msg)) = ws.next().await {
                            if let Message::Text(text) = msg {
                                received.push(text.to_string());
                                if received.len() == 4 {
                                    break;
                                }
                            }
                        }
                        let _ = tx.send(received);
                    });
                }
            }
        }
    });

    let auth = Arc::new(acp_auth::AuthClient::new(
        AGENT,
        &format!("http://{addr}"),
        paths,
        "pass",
    ));
    let client = MessageClient::new(
        AGENT,
        &format!("http://{addr}"),
        auth,
        TransportConfig {
            connection_timeout_secs: 0.5,
            send_retry_attempts: 1,
            auto_reconnect: false,
            ..Default::default()
        },
    );

    // Socket down: all three sends buffer in FIFO order.
    for msg in ["M1", "M2", "M3"] {
        assert!(client.send(msg).await.is_err());
    }
    assert_eq!(client.outbound_len(), 3);

    // Server comes back; the reconnect drains the buffer before new work.
    accept_ws.store(true, Ordering::SeqCst);
    client.start().await.unwrap();
    client.send("M4").await.unwrap();

    let order = tokio::time::timeout(Duration::from_secs(5), order_rx)
        .await
        .expect("server did not observe messages")
        .unwrap();
    server.abort();

    assert_eq!(order, vec!["M1", "M2", "M3", "M4"]);
    assert_eq!(client.outbound_len(), 0);
    client.stop().await;
}
