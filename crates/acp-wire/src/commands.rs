//! JSON command payloads carried over the message WebSocket.
//!
//! Every frame is an object `{"cmd": <name>, "data": <payload>}`. Field
//! values are strings on the wire (the servers emit stringified numbers);
//! `status_code` tolerates both forms.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// `create_session_req` command name.
pub const CMD_CREATE_SESSION_REQ: &str = "create_session_req";
/// `create_session_ack` command name.
pub const CMD_CREATE_SESSION_ACK: &str = "create_session_ack";
/// `join_session_req` command name.
pub const CMD_JOIN_SESSION_REQ: &str = "join_session_req";
/// `leave_session_req` command name.
pub const CMD_LEAVE_SESSION_REQ: &str = "leave_session_req";
/// `close_session_req` command name.
pub const CMD_CLOSE_SESSION_REQ: &str = "close_session_req";
/// `invite_agent_req` command name.
pub const CMD_INVITE_AGENT_REQ: &str = "invite_agent_req";
/// `invite_agent_ack` command name.
pub const CMD_INVITE_AGENT_ACK: &str = "invite_agent_ack";
/// `eject_agent_req` command name.
pub const CMD_EJECT_AGENT_REQ: &str = "eject_agent_req";
/// `get_member_list` command name.
pub const CMD_GET_MEMBER_LIST: &str = "get_member_list";
/// `session_message` command name.
pub const CMD_SESSION_MESSAGE: &str = "session_message";
/// `session_message_ack` command name.
pub const CMD_SESSION_MESSAGE_ACK: &str = "session_message_ack";
/// `system_message` command name.
pub const CMD_SYSTEM_MESSAGE: &str = "system_message";
/// `session_create_stream_req` command name.
pub const CMD_SESSION_CREATE_STREAM_REQ: &str = "session_create_stream_req";
/// `session_create_stream_ack` command name.
pub const CMD_SESSION_CREATE_STREAM_ACK: &str = "session_create_stream_ack";
/// `push_text_stream_req` command name.
pub const CMD_PUSH_TEXT_STREAM_REQ: &str = "push_text_stream_req";
/// `close_stream_req` command name.
pub const CMD_CLOSE_STREAM_REQ: &str = "close_stream_req";

/// One WebSocket text frame: a command name plus its payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WsFrame {
    /// Command name.
    pub cmd: String,
    /// Command payload.
    #[serde(default)]
    pub data: Value,
}

impl WsFrame {
    /// Build a frame from a typed payload.
    pub fn new<T: Serialize>(cmd: &str, payload: &T) -> Self {
        Self {
            cmd: cmd.to_owned(),
            data: serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }

    /// Serialize to the wire string.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned())
    }

    /// Parse a frame from a wire string.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Accept a status code written as either a number or a string.
fn status_code<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|v| u16::try_from(v).ok())
            .ok_or_else(|| serde::de::Error::custom("status_code out of range")),
        Value::String(s) => s
            .parse::<u16>()
            .map_err(|_| serde::de::Error::custom("status_code not numeric")),
        _ => Err(serde::de::Error::custom("status_code has wrong type")),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client → server payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Payload of `create_session_req`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionReq {
    /// Caller-generated request id echoed in the ack.
    pub request_id: String,
    /// Session kind, usually `public`.
    #[serde(rename = "type")]
    pub session_type: String,
    /// Display name of the session.
    pub group_name: String,
    /// Subject line.
    pub subject: String,
    /// Unix-millisecond timestamp, stringified.
    pub timestamp: String,
}

/// Payload of `join_session_req`.
///
/// An owner rejoin sends an empty `inviter_agent_id` and its own
/// identifying code as `invite_code`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinSessionReq {
    /// Session being joined.
    pub session_id: String,
    /// Caller-generated request id.
    pub request_id: String,
    /// Identity that issued the invite; empty on owner rejoin.
    pub inviter_agent_id: String,
    /// Invite code or the owner's identifying code.
    pub invite_code: String,
    /// Resume cursor; `"0"` for a full join.
    pub last_msg_id: String,
}

/// Payload of `leave_session_req`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeaveSessionReq {
    /// Session being left.
    pub session_id: String,
    /// Caller-generated request id.
    pub request_id: String,
}

/// Payload of `close_session_req` (owner only).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CloseSessionReq {
    /// Session being closed.
    pub session_id: String,
    /// Caller-generated request id.
    pub request_id: String,
    /// The owner's secret.
    pub identifying_code: String,
}

/// Payload of `invite_agent_req` (owner only).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InviteAgentReq {
    /// Session to invite into.
    pub session_id: String,
    /// Caller-generated request id.
    pub request_id: String,
    /// The inviting identity.
    pub inviter_id: String,
    /// The invited identity.
    pub acceptor_id: String,
    /// The owner's secret.
    pub invite_code: String,
}

/// Payload of `eject_agent_req` (owner only).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EjectAgentReq {
    /// Session to eject from.
    pub session_id: String,
    /// Caller-generated request id.
    pub request_id: String,
    /// The identity being removed.
    pub eject_agent_id: String,
    /// The owner's secret.
    pub identifying_code: String,
}

/// Payload of `get_member_list`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetMemberListReq {
    /// Session queried.
    pub session_id: String,
    /// Caller-generated request id.
    pub request_id: String,
}

/// Payload of `session_message`, outbound and inbound.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    /// Application-level message id.
    pub message_id: String,
    /// Session the message belongs to.
    pub session_id: String,
    /// Reply-threading reference, empty when unused.
    #[serde(default)]
    pub ref_msg_id: String,
    /// Sending identity.
    pub sender: String,
    /// Semicolon-joined receiving identities.
    pub receiver: String,
    /// URL-encoded JSON block array.
    pub message: String,
    /// Unix-millisecond timestamp, stringified.
    #[serde(default)]
    pub timestamp: String,
    /// Optional router instruction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<Value>,
}

/// Payload of `session_create_stream_req`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionCreateStreamReq {
    /// Session the stream belongs to.
    pub session_id: String,
    /// Caller-generated request id, matched against the ack.
    pub request_id: String,
    /// Reply-threading reference.
    #[serde(default)]
    pub ref_msg_id: String,
    /// Creating identity.
    pub sender: String,
    /// Comma-joined receiving identities.
    pub receiver: String,
    /// `text/event-stream` or `file/binary`.
    pub content_type: String,
    /// Unix-millisecond timestamp, stringified.
    pub timestamp: String,
}

/// Payload of `push_text_stream_req` sent on a stream socket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PushTextStreamReq {
    /// URL-encoded chunk text.
    pub chunk: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Server → client payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Payload of `create_session_ack`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionAck {
    /// Echo of the request id.
    pub request_id: String,
    /// Server-assigned session id.
    pub session_id: String,
    /// Owner secret for rejoin/invite.
    pub identifying_code: String,
    /// HTTP-style status.
    #[serde(deserialize_with = "status_code")]
    pub status_code: u16,
    /// Server message.
    #[serde(default)]
    pub message: String,
}

/// Payload of `invite_agent_ack`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InviteAgentAck {
    /// Session invited into.
    pub session_id: String,
    /// HTTP-style status; 404 means the invitee is offline.
    #[serde(deserialize_with = "status_code")]
    pub status_code: u16,
    /// The invited identity.
    #[serde(default)]
    pub acceptor_id: String,
    /// Server message.
    #[serde(default)]
    pub message: String,
}

/// Payload of `session_message_ack`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionMessageAck {
    /// Session the acked message belongs to.
    pub session_id: String,
    /// HTTP-style status; 404 reports offline receivers.
    #[serde(deserialize_with = "status_code")]
    pub status_code: u16,
    /// Receivers the server could not deliver to.
    #[serde(default)]
    pub offline_receivers: Vec<String>,
}

/// Payload of `system_message`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    /// Session the event concerns.
    pub session_id: String,
    /// Event name, e.g. `Session dismissed`.
    pub event_type: String,
}

/// Payload of `session_create_stream_ack`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionCreateStreamAck {
    /// Session the stream belongs to.
    pub session_id: String,
    /// Echo of the request id.
    pub request_id: String,
    /// WebSocket URL the creator pushes chunks to.
    pub push_url: String,
    /// URL receivers pull the stream from.
    pub pull_url: String,
    /// Message id bound to the stream.
    pub message_id: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let req = CreateSessionReq {
            request_id: "r1".into(),
            session_type: "public".into(),
            group_name: "t".into(),
            subject: String::new(),
            timestamp: "1700000000000".into(),
        };
        let frame = WsFrame::new(CMD_CREATE_SESSION_REQ, &req);
        let wire = frame.to_json();
        let back = WsFrame::parse(&wire).unwrap();
        assert_eq!(back.cmd, "create_session_req");
        let payload: CreateSessionReq = serde_json::from_value(back.data).unwrap();
        assert_eq!(payload, req);
    }

    #[test]
    fn session_type_serializes_as_type() {
        let req = CreateSessionReq {
            request_id: "r".into(),
            session_type: "public".into(),
            group_name: "g".into(),
            subject: "s".into(),
            timestamp: "0".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "public");
        assert!(json.get("session_type").is_none());
    }

    #[test]
    fn owner_rejoin_has_empty_inviter() {
        let req = JoinSessionReq {
            session_id: "s1".into(),
            request_id: "r1".into(),
            inviter_agent_id: String::new(),
            invite_code: "secret".into(),
            last_msg_id: "0".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["inviter_agent_id"], "");
        assert_eq!(json["invite_code"], "secret");
    }

    #[test]
    fn status_code_accepts_number() {
        let ack: CreateSessionAck = serde_json::from_value(serde_json::json!({
            "request_id": "r", "session_id": "s", "identifying_code": "c",
            "status_code": 200, "message": "ok"
        }))
        .unwrap();
        assert_eq!(ack.status_code, 200);
    }

    #[test]
    fn status_code_accepts_string() {
        let ack: CreateSessionAck = serde_json::from_value(serde_json::json!({
            "request_id": "r", "session_id": "s", "identifying_code": "c",
            "status_code": "200"
        }))
        .unwrap();
        assert_eq!(ack.status_code, 200);
        assert_eq!(ack.message, "");
    }

    #[test]
    fn status_code_rejects_garbage() {
        let result: Result<InviteAgentAck, _> = serde_json::from_value(serde_json::json!({
            "session_id": "s", "status_code": [1]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn message_ack_defaults_offline_receivers() {
        let ack: SessionMessageAck = serde_json::from_value(serde_json::json!({
            "session_id": "s", "status_code": 200
        }))
        .unwrap();
        assert!(ack.offline_receivers.is_empty());
    }

    #[test]
    fn message_ack_404_carries_receivers() {
        let ack: SessionMessageAck = serde_json::from_value(serde_json::json!({
            "session_id": "s", "status_code": "404",
            "offline_receivers": ["b.corp.example"]
        }))
        .unwrap();
        assert_eq!(ack.status_code, 404);
        assert_eq!(ack.offline_receivers, vec!["b.corp.example"]);
    }

    #[test]
    fn session_message_omits_absent_instruction() {
        let msg = SessionMessage {
            message_id: "m".into(),
            session_id: "s".into(),
            ref_msg_id: String::new(),
            sender: "a.corp.example".into(),
            receiver: "b.corp.example".into(),
            message: "%5B%5D".into(),
            timestamp: "0".into(),
            instruction: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("instruction").is_none());
    }

    #[test]
    fn stream_ack_round_trip() {
        let ack = SessionCreateStreamAck {
            session_id: "s".into(),
            request_id: "r".into(),
            push_url: "wss://ts.example/push?id=1".into(),
            pull_url: "https://ts.example/pull?id=1".into(),
            message_id: "m1".into(),
        };
        let json = serde_json::to_string(&ack).unwrap();
        let back: SessionCreateStreamAck = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ack);
    }

    #[test]
    fn frame_parse_missing_data_defaults_null() {
        let frame = WsFrame::parse(r#"{"cmd": "get_member_list"}"#).unwrap();
        assert_eq!(frame.cmd, CMD_GET_MEMBER_LIST);
        assert!(frame.data.is_null());
    }

    #[test]
    fn frame_parse_rejects_non_json() {
        assert!(WsFrame::parse("not json").is_err());
    }
}
