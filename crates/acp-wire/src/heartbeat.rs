//! Fixed-layout UDP records for the heartbeat channel.
//!
//! Layout is little-endian. Every datagram starts with the common header
//! (`mask:u32 seq:u32 type:u16 payload_size:u16`); strings are u16
//! length-prefixed UTF-8. Record types:
//!
//! | type | record |
//! |---|---|
//! | 513 | heartbeat request (agent id, sign cookie) |
//! | 258 | heartbeat ack (`next_beat` interval; `401` = stale sign-in) |
//! | 259 | session invite (session id, inviter, invite code, server URL) |
//! | 516 | invite acknowledgement |

use crate::WireError;

/// Heartbeat request message type.
pub const TYPE_HEARTBEAT_REQ: u16 = 513;
/// Heartbeat acknowledgement message type.
pub const TYPE_HEARTBEAT_ACK: u16 = 258;
/// Session invite message type.
pub const TYPE_INVITE_REQ: u16 = 259;
/// Invite acknowledgement message type.
pub const TYPE_INVITE_ACK: u16 = 516;

/// `next_beat` sentinel meaning the sign-in cookie went stale.
pub const NEXT_BEAT_AUTH_STALE: u32 = 401;

/// Size of the common header in bytes.
pub const HEADER_LEN: usize = 12;

/// Common header carried by every datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UdpHeader {
    /// Reserved mask bits; zero on everything this client sends.
    pub message_mask: u32,
    /// Per-socket monotonically increasing sequence number.
    pub message_seq: u32,
    /// Record type.
    pub message_type: u16,
    /// Body size in bytes.
    pub payload_size: u16,
}

impl UdpHeader {
    /// Header for an outbound record.
    #[must_use]
    pub fn new(message_type: u16, message_seq: u32, payload_size: u16) -> Self {
        Self {
            message_mask: 0,
            message_seq,
            message_type,
            payload_size,
        }
    }

    fn encode_into(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.message_mask.to_le_bytes());
        out.extend_from_slice(&self.message_seq.to_le_bytes());
        out.extend_from_slice(&self.message_type.to_le_bytes());
        out.extend_from_slice(&self.payload_size.to_le_bytes());
    }

    /// Decode the common header from the start of a datagram.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                need: HEADER_LEN,
                have: data.len(),
            });
        }
        Ok(Self {
            message_mask: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            message_seq: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            message_type: u16::from_le_bytes([data[8], data[9]]),
            payload_size: u16::from_le_bytes([data[10], data[11]]),
        })
    }
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    let len = u16::try_from(bytes.len()).unwrap_or(u16::MAX);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&bytes[..usize::from(len)]);
}

fn take_string<'a>(
    data: &'a [u8],
    offset: &mut usize,
    field: &'static str,
) -> Result<&'a str, WireError> {
    if data.len() < *offset + 2 {
        return Err(WireError::Truncated {
            need: *offset + 2,
            have: data.len(),
        });
    }
    let len = usize::from(u16::from_le_bytes([data[*offset], data[*offset + 1]]));
    *offset += 2;
    if data.len() < *offset + len {
        return Err(WireError::Truncated {
            need: *offset + len,
            have: data.len(),
        });
    }
    let s = std::str::from_utf8(&data[*offset..*offset + len])
        .map_err(|_| WireError::InvalidUtf8(field))?;
    *offset += len;
    Ok(s)
}

fn take_u32(data: &[u8], offset: &mut usize) -> Result<u32, WireError> {
    if data.len() < *offset + 4 {
        return Err(WireError::Truncated {
            need: *offset + 4,
            have: data.len(),
        });
    }
    let v = u32::from_le_bytes([
        data[*offset],
        data[*offset + 1],
        data[*offset + 2],
        data[*offset + 3],
    ]);
    *offset += 4;
    Ok(v)
}

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// Periodic heartbeat request (type 513).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatRequest {
    /// Sequence number stamped into the header.
    pub seq: u32,
    /// Sender identity.
    pub agent_id: String,
    /// Cookie handed out at sign-in.
    pub sign_cookie: u32,
}

/// Heartbeat acknowledgement (type 258).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatAck {
    /// Sequence number stamped into the header.
    pub seq: u32,
    /// Server-adjusted interval in milliseconds, or [`NEXT_BEAT_AUTH_STALE`].
    pub next_beat: u32,
}

/// Session invite pushed from the server (type 259).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InviteRequest {
    /// Sequence number stamped into the header.
    pub seq: u32,
    /// Session being joined.
    pub session_id: String,
    /// Identity of the inviter.
    pub inviter_id: String,
    /// One-shot code authorising the join.
    pub invite_code: String,
    /// Message server the session lives on.
    pub message_server: String,
}

/// Invite acknowledgement (type 516).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InviteAck {
    /// Sequence number stamped into the header.
    pub seq: u32,
    /// Acknowledging identity.
    pub agent_id: String,
    /// Identity of the inviter being acknowledged.
    pub inviter_id: String,
    /// Cookie handed out at sign-in.
    pub sign_cookie: u32,
}

/// Any record this client can receive or send on the heartbeat channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UdpRecord {
    /// Type 513.
    HeartbeatRequest(HeartbeatRequest),
    /// Type 258.
    HeartbeatAck(HeartbeatAck),
    /// Type 259.
    InviteRequest(InviteRequest),
    /// Type 516.
    InviteAck(InviteAck),
}

fn encode_record(message_type: u16, seq: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    let size = u16::try_from(body.len()).unwrap_or(u16::MAX);
    UdpHeader::new(message_type, seq, size).encode_into(&mut out);
    out.extend_from_slice(body);
    out
}

impl HeartbeatRequest {
    /// Serialize to a datagram.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        put_string(&mut body, &self.agent_id);
        body.extend_from_slice(&self.sign_cookie.to_le_bytes());
        encode_record(TYPE_HEARTBEAT_REQ, self.seq, &body)
    }
}

impl HeartbeatAck {
    /// Serialize to a datagram.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let body = self.next_beat.to_le_bytes().to_vec();
        encode_record(TYPE_HEARTBEAT_ACK, self.seq, &body)
    }
}

impl InviteRequest {
    /// Serialize to a datagram.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        put_string(&mut body, &self.session_id);
        put_string(&mut body, &self.inviter_id);
        put_string(&mut body, &self.invite_code);
        put_string(&mut body, &self.message_server);
        encode_record(TYPE_INVITE_REQ, self.seq, &body)
    }
}

impl InviteAck {
    /// Serialize to a datagram.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        put_string(&mut body, &self.agent_id);
        put_string(&mut body, &self.inviter_id);
        body.extend_from_slice(&self.sign_cookie.to_le_bytes());
        encode_record(TYPE_INVITE_ACK, self.seq, &body)
    }
}

/// Decode a datagram into a typed record.
pub fn decode_datagram(data: &[u8]) -> Result<UdpRecord, WireError> {
    let header = UdpHeader::decode(data)?;
    let body = &data[HEADER_LEN..];
    let mut offset = 0;
    match header.message_type {
        TYPE_HEARTBEAT_REQ => {
            let agent_id = take_string(body, &mut offset, "agent_id")?.to_owned();
            let sign_cookie = take_u32(body, &mut offset)?;
            Ok(UdpRecord::HeartbeatRequest(HeartbeatRequest {
                seq: header.message_seq,
                agent_id,
                sign_cookie,
            }))
        }
        TYPE_HEARTBEAT_ACK => {
            let next_beat = take_u32(body, &mut offset)?;
            Ok(UdpRecord::HeartbeatAck(HeartbeatAck {
                seq: header.message_seq,
                next_beat,
            }))
        }
        TYPE_INVITE_REQ => {
            let session_id = take_string(body, &mut offset, "session_id")?.to_owned();
            let inviter_id = take_string(body, &mut offset, "inviter_id")?.to_owned();
            let invite_code = take_string(body, &mut offset, "invite_code")?.to_owned();
            let message_server = take_string(body, &mut offset, "message_server")?.to_owned();
            Ok(UdpRecord::InviteRequest(InviteRequest {
                seq: header.message_seq,
                session_id,
                inviter_id,
                invite_code,
                message_server,
            }))
        }
        TYPE_INVITE_ACK => {
            let agent_id = take_string(body, &mut offset, "agent_id")?.to_owned();
            let inviter_id = take_string(body, &mut offset, "inviter_id")?.to_owned();
            let sign_cookie = take_u32(body, &mut offset)?;
            Ok(UdpRecord::InviteAck(InviteAck {
                seq: header.message_seq,
                agent_id,
                inviter_id,
                sign_cookie,
            }))
        }
        other => Err(WireError::UnknownType(other)),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn header_round_trip() {
        let header = UdpHeader::new(TYPE_HEARTBEAT_REQ, 42, 17);
        let mut bytes = Vec::new();
        header.encode_into(&mut bytes);
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(UdpHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn header_too_short() {
        assert_matches!(
            UdpHeader::decode(&[0u8; 4]),
            Err(WireError::Truncated { need: 12, have: 4 })
        );
    }

    #[test]
    fn heartbeat_request_round_trip() {
        let req = HeartbeatRequest {
            seq: 7,
            agent_id: "a.corp.example".into(),
            sign_cookie: 0xDEAD_BEEF,
        };
        let bytes = req.encode();
        assert_matches!(
            decode_datagram(&bytes).unwrap(),
            UdpRecord::HeartbeatRequest(back) if back == req
        );
    }

    #[test]
    fn heartbeat_ack_round_trip() {
        let ack = HeartbeatAck {
            seq: 9,
            next_beat: 5000,
        };
        let bytes = ack.encode();
        assert_matches!(
            decode_datagram(&bytes).unwrap(),
            UdpRecord::HeartbeatAck(back) if back == ack
        );
    }

    #[test]
    fn stale_auth_sentinel_is_distinguishable() {
        let ack = HeartbeatAck {
            seq: 1,
            next_beat: NEXT_BEAT_AUTH_STALE,
        };
        let bytes = ack.encode();
        let UdpRecord::HeartbeatAck(back) = decode_datagram(&bytes).unwrap() else {
            panic!("wrong record");
        };
        assert_eq!(back.next_beat, 401);
    }

    #[test]
    fn invite_round_trip() {
        let invite = InviteRequest {
            seq: 3,
            session_id: "sess-123".into(),
            inviter_id: "b.corp.example".into(),
            invite_code: "c0de".into(),
            message_server: "https://msg.corp.example".into(),
        };
        let bytes = invite.encode();
        assert_matches!(
            decode_datagram(&bytes).unwrap(),
            UdpRecord::InviteRequest(back) if back == invite
        );
    }

    #[test]
    fn invite_ack_round_trip() {
        let ack = InviteAck {
            seq: 4,
            agent_id: "a.corp.example".into(),
            inviter_id: "b.corp.example".into(),
            sign_cookie: 99,
        };
        let bytes = ack.encode();
        assert_matches!(
            decode_datagram(&bytes).unwrap(),
            UdpRecord::InviteAck(back) if back == ack
        );
    }

    #[test]
    fn encode_decode_is_byte_exact() {
        let req = HeartbeatRequest {
            seq: 1,
            agent_id: "x.y.z".into(),
            sign_cookie: 5,
        };
        let bytes = req.encode();
        let UdpRecord::HeartbeatRequest(back) = decode_datagram(&bytes).unwrap() else {
            panic!("wrong record");
        };
        assert_eq!(back.encode(), bytes);
    }

    #[test]
    fn unknown_type_rejected() {
        let mut bytes = Vec::new();
        UdpHeader::new(999, 0, 0).encode_into(&mut bytes);
        assert_matches!(decode_datagram(&bytes), Err(WireError::UnknownType(999)));
    }

    #[test]
    fn truncated_body_rejected() {
        let req = HeartbeatRequest {
            seq: 1,
            agent_id: "a.corp.example".into(),
            sign_cookie: 5,
        };
        let bytes = req.encode();
        assert_matches!(
            decode_datagram(&bytes[..bytes.len() - 2]),
            Err(WireError::Truncated { .. })
        );
    }

    #[test]
    fn invalid_utf8_rejected() {
        let mut body = Vec::new();
        body.extend_from_slice(&2u16.to_le_bytes());
        body.extend_from_slice(&[0xFF, 0xFE]);
        body.extend_from_slice(&0u32.to_le_bytes());
        let bytes = encode_record(TYPE_HEARTBEAT_REQ, 0, &body);
        assert_matches!(
            decode_datagram(&bytes),
            Err(WireError::InvalidUtf8("agent_id"))
        );
    }
}
