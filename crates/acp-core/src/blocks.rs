//! Message content blocks and the session-wire envelope codec.
//!
//! A session message body is a heterogeneous array of [`Block`]s. On the
//! wire the array is JSON-encoded and then URL-encoded into the `message`
//! field of a `session_message` frame; [`encode_envelope`] and
//! [`decode_envelope`] are exact inverses.

use std::time::{SystemTime, UNIX_EPOCH};

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::AcpError;

/// Escape set for envelope bodies: everything except unreserved chars and `/`.
const ENVELOPE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn default_status() -> String {
    "success".to_owned()
}

/// One element of a session message body, discriminated by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Block {
    /// Plain text content.
    #[serde(rename = "content")]
    Content {
        /// Delivery status, usually `success`.
        #[serde(default = "default_status")]
        status: String,
        /// Unix-millisecond timestamp.
        #[serde(default)]
        timestamp: u64,
        /// The text payload.
        content: String,
        /// Free-form side channel (pull URL for fetched streams, etc.).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra: Option<String>,
    },

    /// A tool invocation request.
    #[serde(rename = "tool_call")]
    ToolCall {
        /// Delivery status.
        #[serde(default = "default_status")]
        status: String,
        /// Unix-millisecond timestamp.
        #[serde(default)]
        timestamp: u64,
        /// Structured call payload.
        content: Value,
    },

    /// The result of a tool invocation.
    #[serde(rename = "tool_result")]
    ToolResult {
        /// Delivery status.
        #[serde(default = "default_status")]
        status: String,
        /// Unix-millisecond timestamp.
        #[serde(default)]
        timestamp: u64,
        /// Structured result payload.
        content: Value,
    },

    /// Pointer to a server-sent-event text stream; `content` is the pull URL.
    #[serde(rename = "text/event-stream")]
    TextEventStream {
        /// Delivery status.
        #[serde(default = "default_status")]
        status: String,
        /// Unix-millisecond timestamp.
        #[serde(default)]
        timestamp: u64,
        /// Pull URL for the stream.
        content: String,
        /// Free-form side channel.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra: Option<String>,
    },

    /// Pointer to a binary file stream; `content` is the pull URL.
    #[serde(rename = "file/binary")]
    FileBinary {
        /// Delivery status.
        #[serde(default = "default_status")]
        status: String,
        /// Unix-millisecond timestamp.
        #[serde(default)]
        timestamp: u64,
        /// Pull URL for the file stream.
        content: String,
        /// Free-form side channel.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra: Option<String>,
    },

    /// A form presented to the peer.
    #[serde(rename = "form")]
    Form {
        /// Delivery status.
        #[serde(default = "default_status")]
        status: String,
        /// Unix-millisecond timestamp.
        #[serde(default)]
        timestamp: u64,
        /// Form field definitions.
        content: Value,
    },

    /// The filled-in results of a previously sent form.
    #[serde(rename = "form_result")]
    FormResult {
        /// Delivery status.
        #[serde(default = "default_status")]
        status: String,
        /// Unix-millisecond timestamp.
        #[serde(default)]
        timestamp: u64,
        /// Result payload.
        content: Value,
    },

    /// A locally or remotely synthesized error visible to handlers.
    #[serde(rename = "error")]
    Error {
        /// Delivery status.
        #[serde(default = "default_status")]
        status: String,
        /// Unix-millisecond timestamp.
        #[serde(default)]
        timestamp: u64,
        /// Error description.
        content: String,
        /// Free-form side channel.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra: Option<String>,
    },

    /// Liveness probe; answered by the dispatcher without user handlers.
    #[serde(rename = "ping")]
    Ping {
        /// Delivery status.
        #[serde(default = "default_status")]
        status: String,
        /// Unix-millisecond timestamp.
        #[serde(default)]
        timestamp: u64,
        /// Probe payload, usually empty.
        #[serde(default)]
        content: String,
    },
}

impl Block {
    /// A `content` block stamped with the current time.
    #[must_use]
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content {
            status: default_status(),
            timestamp: unix_millis(),
            content: text.into(),
            extra: None,
        }
    }

    /// An `error` block stamped with the current time.
    #[must_use]
    pub fn error(text: impl Into<String>) -> Self {
        Self::Error {
            status: default_status(),
            timestamp: unix_millis(),
            content: text.into(),
            extra: None,
        }
    }

    /// A `ping` block stamped with the current time.
    #[must_use]
    pub fn ping() -> Self {
        Self::Ping {
            status: default_status(),
            timestamp: unix_millis(),
            content: String::new(),
        }
    }

    /// The wire discriminator for this block.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Content { .. } => "content",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::TextEventStream { .. } => "text/event-stream",
            Self::FileBinary { .. } => "file/binary",
            Self::Form { .. } => "form",
            Self::FormResult { .. } => "form_result",
            Self::Error { .. } => "error",
            Self::Ping { .. } => "ping",
        }
    }

    /// Whether this block is a liveness probe.
    #[must_use]
    pub fn is_ping(&self) -> bool {
        matches!(self, Self::Ping { .. })
    }

    /// Whether this block points at a sub-stream (text or binary).
    #[must_use]
    pub fn is_stream_pointer(&self) -> bool {
        matches!(self, Self::TextEventStream { .. } | Self::FileBinary { .. })
    }
}

/// Router instruction attached to a session message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstructionBlock {
    /// Command name matched against router-scoped handlers.
    pub cmd: String,
    /// Optional command payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl InstructionBlock {
    /// An instruction with no payload.
    #[must_use]
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            data: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope codec
// ─────────────────────────────────────────────────────────────────────────────

/// JSON-encode a block array and URL-encode the result for the wire.
#[must_use]
pub fn encode_envelope(blocks: &[Block]) -> String {
    let json = serde_json::to_string(blocks).unwrap_or_else(|_| "[]".to_owned());
    utf8_percent_encode(&json, ENVELOPE_SET).to_string()
}

/// Inverse of [`encode_envelope`].
///
/// Accepts either a JSON array or a bare single object (older peers emit
/// the latter), returning a block array either way.
pub fn decode_envelope(wire: &str) -> Result<Vec<Block>, AcpError> {
    let decoded = percent_decode_str(wire)
        .decode_utf8()
        .map_err(|e| AcpError::internal("ENVELOPE_DECODE_ERROR", e.to_string()))?;
    let trimmed = decoded.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if let Ok(blocks) = serde_json::from_str::<Vec<Block>>(trimmed) {
        return Ok(blocks);
    }
    let single: Block = serde_json::from_str(trimmed)
        .map_err(|e| AcpError::internal("ENVELOPE_DECODE_ERROR", e.to_string()))?;
    Ok(vec![single])
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_block_serializes_with_type_tag() {
        let block = Block::content("hello");
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "content");
        assert_eq!(json["status"], "success");
        assert_eq!(json["content"], "hello");
    }

    #[test]
    fn stream_pointer_tag_is_mime_like() {
        let block = Block::TextEventStream {
            status: "success".into(),
            timestamp: 1,
            content: "https://ts.example/pull?id=1".into(),
            extra: None,
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "text/event-stream");
        assert!(block.is_stream_pointer());
    }

    #[test]
    fn ping_detection() {
        assert!(Block::ping().is_ping());
        assert!(!Block::content("x").is_ping());
    }

    #[test]
    fn kind_matches_wire_tag() {
        for block in [Block::content("a"), Block::error("b"), Block::ping()] {
            let json = serde_json::to_value(&block).unwrap();
            assert_eq!(json["type"], block.kind());
        }
    }

    #[test]
    fn decode_tolerates_missing_status_and_timestamp() {
        let blocks =
            decode_envelope("%5B%7B%22type%22%3A%22content%22%2C%22content%22%3A%22hi%22%7D%5D")
                .unwrap();
        assert_eq!(blocks.len(), 1);
        assert_matches::assert_matches!(
            &blocks[0],
            Block::Content { status, content, .. } if status == "success" && content == "hi"
        );
    }

    #[test]
    fn envelope_round_trip() {
        let blocks = vec![
            Block::content("hello world / 你好"),
            Block::error("recipient offline"),
        ];
        let wire = encode_envelope(&blocks);
        // The wire form must be plain ASCII with no raw JSON delimiters.
        assert!(wire.is_ascii());
        assert!(!wire.contains('{'));
        let back = decode_envelope(&wire).unwrap();
        assert_eq!(back, blocks);
    }

    #[test]
    fn decode_accepts_bare_object() {
        let wire = encode_envelope(&[Block::content("solo")]);
        // Strip the array brackets to simulate an older peer.
        let inner = wire
            .strip_prefix("%5B")
            .and_then(|w| w.strip_suffix("%5D"))
            .unwrap();
        let back = decode_envelope(inner).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].kind(), "content");
    }

    #[test]
    fn decode_empty_is_empty() {
        assert!(decode_envelope("").unwrap().is_empty());
    }

    #[test]
    fn decode_garbage_is_error() {
        assert!(decode_envelope("%7Bnot-json").is_err());
    }

    #[test]
    fn instruction_round_trip() {
        let block = InstructionBlock {
            cmd: "weather.lookup".into(),
            data: Some(serde_json::json!({"city": "Berlin"})),
        };
        let json = serde_json::to_string(&block).unwrap();
        let back: InstructionBlock = serde_json::from_str(&json).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn instruction_without_data_omits_field() {
        let json = serde_json::to_string(&InstructionBlock::new("noop")).unwrap();
        assert!(!json.contains("data"));
    }

    #[test]
    fn unix_millis_is_monotonic_enough() {
        let a = unix_millis();
        let b = unix_millis();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000);
    }
}
