//! Secondary WebSocket for one outbound stream.
//!
//! A stream client pushes text chunks (`push_text_stream_req` JSON frames)
//! or binary file chunks (16-byte-header frames) to the push URL returned by
//! a stream-creation ack. Chunks sent while the socket is down are buffered
//! locally and the send reports failure so the caller can pace.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use acp_core::errors::{AcpError, TransportError};
use acp_wire::commands::{CMD_CLOSE_STREAM_REQ, CMD_PUSH_TEXT_STREAM_REQ, WsFrame};
use acp_wire::frame::{FrameHeader, encode_frame};

/// Handshake wait for the push socket.
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
/// Initial push-cache budget in bytes.
const PUSH_CACHE_BUDGET: i64 = 65_536;
/// Budget floor below which the caller should pace.
const PUSH_CACHE_LOW_WATER: i64 = 16_384;

type StreamSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// A chunk that could not be sent while the socket was down.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PendingChunk {
    /// A text chunk, pre-encoding.
    Text(String),
    /// A binary chunk with its file offset.
    Binary {
        /// Byte offset within the file.
        offset: u32,
        /// Raw chunk bytes.
        bytes: Vec<u8>,
    },
}

/// Push-side client for one active stream.
pub struct StreamClient {
    agent_id: String,
    session_id: String,
    push_url: String,
    ws_url: String,
    open: AtomicBool,
    sink: tokio::sync::Mutex<Option<StreamSink>>,
    pending: Mutex<VecDeque<PendingChunk>>,
    push_cache_left: AtomicI64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StreamClient {
    /// Create a client for `push_url`, authenticating with `signature`.
    #[must_use]
    pub fn new(agent_id: &str, session_id: &str, push_url: &str, signature: &str) -> Self {
        let ws_url = format!(
            "{}&agent_id={agent_id}&signature={signature}",
            push_url
                .trim_end_matches('/')
                .replace("https://", "wss://")
                .replace("http://", "ws://")
        );
        Self {
            agent_id: agent_id.to_owned(),
            session_id: session_id.to_owned(),
            push_url: push_url.to_owned(),
            ws_url,
            open: AtomicBool::new(false),
            sink: tokio::sync::Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            push_cache_left: AtomicI64::new(PUSH_CACHE_BUDGET),
            reader: Mutex::new(None),
        }
    }

    /// The push URL this client was created for (map key in the session).
    #[must_use]
    pub fn push_url(&self) -> &str {
        &self.push_url
    }

    /// Whether the push socket is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    /// Chunks buffered while the socket was down.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Remaining push-cache budget in bytes.
    #[must_use]
    pub fn budget_left(&self) -> i64 {
        self.push_cache_left.load(Ordering::Relaxed)
    }

    /// Establish the push socket; waits up to ~5 s for the handshake.
    pub async fn open(self: &Arc<Self>) -> Result<(), AcpError> {
        if self.is_open() {
            return Ok(());
        }
        debug!(session_id = %self.session_id, "opening stream socket");
        let connect = tokio::time::timeout(OPEN_TIMEOUT, connect_async(&self.ws_url))
            .await
            .map_err(|_| TransportError::timeout("stream handshake timed out"))?;
        let (ws, _response) =
            connect.map_err(|e| TransportError::connection(e.to_string()).with_source(e))?;
        let (sink, mut stream) = ws.split();
        *self.sink.lock().await = Some(sink);
        self.open.store(true, Ordering::Relaxed);

        // Drain inbound frames; the push socket only ever sees control text.
        let me = self.clone();
        let reader = tokio::spawn(async move {
            while let Some(next) = stream.next().await {
                match next {
                    Ok(Message::Text(text)) => {
                        debug!(agent_id = %me.agent_id, %text, "stream socket message");
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            me.open.store(false, Ordering::Relaxed);
            debug!(session_id = %me.session_id, "stream socket closed");
        });
        *self.reader.lock() = Some(reader);
        info!(session_id = %self.session_id, "stream socket open");
        Ok(())
    }

    async fn send_message(&self, message: Message) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(TransportError::not_connected());
        };
        sink.send(message)
            .await
            .map_err(|e| TransportError::connection(e.to_string()))
    }

    /// Ensure the socket is up, reconnecting best-effort; on failure the
    /// chunk is buffered and an error returned.
    async fn ensure_open(self: &Arc<Self>, fallback: PendingChunk) -> Result<(), AcpError> {
        if self.is_open() {
            return Ok(());
        }
        if self.open().await.is_ok() && self.is_open() {
            return Ok(());
        }
        warn!(session_id = %self.session_id, "stream socket down, buffering chunk");
        self.pending.lock().push_back(fallback);
        Err(TransportError::not_connected().into())
    }

    /// Send one text chunk as a `push_text_stream_req` frame.
    pub async fn send_text_chunk(self: &Arc<Self>, chunk: &str) -> Result<(), AcpError> {
        self.ensure_open(PendingChunk::Text(chunk.to_owned()))
            .await?;
        let frame = WsFrame::new(
            CMD_PUSH_TEXT_STREAM_REQ,
            &acp_wire::commands::PushTextStreamReq {
                chunk: utf8_percent_encode(chunk, NON_ALPHANUMERIC).to_string(),
            },
        );
        self.send_message(Message::Text(frame.to_json().into()))
            .await
            .map_err(AcpError::from)
    }

    /// Send one binary file chunk at `offset`.
    ///
    /// Returns `Ok(true)` while the push-cache budget holds; `Ok(false)`
    /// means the budget is depleted and the caller should pace.
    pub async fn send_binary_chunk(
        self: &Arc<Self>,
        offset: u32,
        bytes: &[u8],
    ) -> Result<bool, AcpError> {
        self.ensure_open(PendingChunk::Binary {
            offset,
            bytes: bytes.to_vec(),
        })
        .await?;

        let framed = encode_frame(FrameHeader::file_chunk(offset), bytes);
        self.send_message(Message::Binary(framed.into()))
            .await
            .map_err(AcpError::from)?;

        let size = i64::try_from(bytes.len()).unwrap_or(i64::MAX);
        let left = self.push_cache_left.fetch_sub(size, Ordering::Relaxed) - size;
        Ok(left >= PUSH_CACHE_LOW_WATER)
    }

    /// Send `close_stream_req` and tear the socket down.
    pub async fn close(self: &Arc<Self>) {
        if self.is_open() {
            let frame = WsFrame {
                cmd: CMD_CLOSE_STREAM_REQ.to_owned(),
                data: serde_json::Value::Null,
            };
            if let Err(e) = self.send_message(Message::Text(frame.to_json().into())).await {
                debug!(error = %e, "close_stream_req send failed");
            }
        }
        self.open.store(false, Ordering::Relaxed);
        {
            let mut guard = self.sink.lock().await;
            if let Some(mut sink) = guard.take() {
                let _ = tokio::time::timeout(Duration::from_secs(1), sink.close()).await;
            }
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        info!(session_id = %self.session_id, push_url = %self.push_url, "stream closed");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_stream() -> Arc<StreamClient> {
        Arc::new(StreamClient::new(
            "a.corp.example",
            "sess-1",
            "https://ts.corp.example/push?id=9",
            "tok",
        ))
    }

    #[test]
    fn ws_url_gains_identity_params() {
        let stream = test_stream();
        assert_eq!(
            stream.ws_url,
            "wss://ts.corp.example/push?id=9&agent_id=a.corp.example&signature=tok"
        );
        assert_eq!(stream.push_url(), "https://ts.corp.example/push?id=9");
    }

    #[test]
    fn budget_starts_full() {
        let stream = test_stream();
        assert_eq!(stream.budget_left(), 65_536);
        assert!(!stream.is_open());
        assert_eq!(stream.pending_len(), 0);
    }

    #[tokio::test]
    async fn text_chunk_buffered_when_closed() {
        let stream = test_stream();
        // The best-effort reconnect fails (no server), so the chunk lands in
        // the pending buffer and the call errors.
        let err = stream.send_text_chunk("hello").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(stream.pending_len(), 1);
        assert_eq!(
            *stream.pending.lock().front().unwrap(),
            PendingChunk::Text("hello".into())
        );
    }

    #[tokio::test]
    async fn binary_chunk_buffered_when_closed() {
        let stream = test_stream();
        let err = stream.send_binary_chunk(1024, &[1, 2, 3]).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            *stream.pending.lock().front().unwrap(),
            PendingChunk::Binary {
                offset: 1024,
                bytes: vec![1, 2, 3]
            }
        );
    }

    #[tokio::test]
    async fn binary_chunks_over_local_server() {
        // Stand-in push endpoint.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let mut frames = Vec::new();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Binary(b) => frames.push(b.to_vec()),
                    Message::Text(t) => {
                        let frame = WsFrame::parse(t.as_str()).unwrap();
                        if frame.cmd == CMD_CLOSE_STREAM_REQ {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            frames
        });

        let stream = Arc::new(StreamClient::new(
            "a.corp.example",
            "sess-1",
            &format!("http://{addr}/push?id=1"),
            "tok",
        ));
        stream.open().await.unwrap();
        assert!(stream.is_open());

        let keep_going = stream.send_binary_chunk(0, &[9u8; 100]).await.unwrap();
        assert!(keep_going);
        stream.close().await;

        let frames = server.await.unwrap();
        assert_eq!(frames.len(), 1);
        let (header, payload) = acp_wire::frame::decode_frame(&frames[0]).unwrap();
        assert_eq!(header.reserved, 0);
        assert_eq!(payload.len(), 100);
        assert_eq!(stream.budget_left(), 65_536 - 100);
    }

    #[tokio::test]
    async fn budget_low_water_signals_pacing() {
        let stream = test_stream();
        stream.open.store(true, Ordering::Relaxed);
        // Fake an open sink is not possible without a socket; exercise the
        // arithmetic directly instead.
        let spent = stream
            .push_cache_left
            .fetch_sub(60_000, Ordering::Relaxed)
            - 60_000;
        assert!(spent < PUSH_CACHE_LOW_WATER);
    }
}
