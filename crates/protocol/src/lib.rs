//! Realtime wire protocol definitions.
//!
//! Protocol version 1. All communication uses JSON text frames over a
//! WebSocket negotiated with the `arc.realtime.v1` subprotocol.
//!
//! Every frame is an [`Envelope`]: `{v, type, id, ts, payload}`. The
//! payload shape is determined by `type`; the typed payload structs below
//! are the full set.

use {
    serde::{Deserialize, Serialize},
    thiserror::Error,
};

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 1;
pub const SUBPROTOCOL: &str = "arc.realtime.v1";
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1_048_576; // 1 MiB
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

// ── Envelope types ───────────────────────────────────────────────────────────

pub mod types {
    pub const HELLO: &str = "hello";
    pub const HELLO_ACK: &str = "hello.ack";
    pub const CONVERSATION_JOIN: &str = "conversation.join";
    pub const MESSAGE_SEND: &str = "message.send";
    pub const MESSAGE_ACK: &str = "message.ack";
    pub const MESSAGE_NEW: &str = "message.new";
    pub const HISTORY_FETCH: &str = "conversation.history.fetch";
    pub const HISTORY_CHUNK: &str = "conversation.history.chunk";
    pub const ERROR: &str = "error";

    pub const ALL: &[&str] = &[
        HELLO,
        HELLO_ACK,
        CONVERSATION_JOIN,
        MESSAGE_SEND,
        MESSAGE_ACK,
        MESSAGE_NEW,
        HISTORY_FETCH,
        HISTORY_CHUNK,
        ERROR,
    ];

    pub fn is_known(t: &str) -> bool {
        ALL.contains(&t)
    }
}

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const BAD_JSON: &str = "bad_json";
    pub const INVALID_ENVELOPE: &str = "invalid_envelope";
    pub const UNSUPPORTED_TYPE: &str = "unsupported_type";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const FORBIDDEN: &str = "forbidden";
    pub const NOT_MEMBER: &str = "not_member";
    pub const TEXT_EMPTY: &str = "text_empty";
    pub const TEXT_TOO_LONG: &str = "text_too_long";
    pub const SERVER_BUSY: &str = "server_busy";
    pub const SLOW_CONSUMER: &str = "slow_consumer";
    pub const SERVER_SHUTDOWN: &str = "server_shutdown";
    pub const INTERNAL: &str = "internal";
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// The wire unit. Fields default during deserialization so that structural
/// problems surface as `invalid_envelope` from [`Envelope::validate`] rather
/// than as JSON errors; only syntactically malformed input is `bad_json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub v: u32,
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub ts: i64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(r#type: impl Into<String>, id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            r#type: r#type.into(),
            id: id.into(),
            ts: now_ms(),
            payload,
        }
    }

    /// Build an `error` envelope.
    pub fn error(id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        let payload = ErrorPayload {
            code: code.into(),
            message: message.into(),
        };
        Self::new(
            types::ERROR,
            id,
            serde_json::to_value(payload).unwrap_or_default(),
        )
    }

    /// Serialize for the wire. Serialization of an owned envelope cannot
    /// fail; an empty string is returned on the impossible path.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Structural validation per the envelope contract.
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.v != PROTOCOL_VERSION {
            return Err(DecodeError::Invalid("unsupported protocol version"));
        }
        if self.r#type.is_empty() {
            return Err(DecodeError::Invalid("empty type"));
        }
        if !types::is_known(&self.r#type) {
            return Err(DecodeError::UnknownType(self.r#type.clone()));
        }
        if self.id.is_empty() {
            return Err(DecodeError::Invalid("empty id"));
        }
        if self.ts == 0 {
            return Err(DecodeError::Invalid("zero timestamp"));
        }
        if !self.payload.is_object() {
            return Err(DecodeError::Invalid("missing payload"));
        }
        Ok(())
    }
}

/// Decode and validate a single text frame.
pub fn decode(text: &str, max_payload_bytes: usize) -> Result<Envelope, DecodeError> {
    if text.len() > max_payload_bytes {
        return Err(DecodeError::PayloadTooLarge(text.len()));
    }
    let env: Envelope =
        serde_json::from_str(text).map_err(|e| DecodeError::BadJson(e.to_string()))?;
    env.validate()?;
    Ok(env)
}

// ── Decode errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    BadJson(String),
    #[error("invalid envelope: {0}")]
    Invalid(&'static str),
    #[error("unknown envelope type: {0}")]
    UnknownType(String),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

impl DecodeError {
    /// Deterministic wire code for the `error` envelope.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::BadJson(_) => error_codes::BAD_JSON,
            Self::Invalid(_) | Self::UnknownType(_) | Self::PayloadTooLarge(_) => {
                error_codes::INVALID_ENVELOPE
            },
        }
    }
}

// ── Typed payloads ───────────────────────────────────────────────────────────

/// Client → server handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Server → client handshake acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAckPayload {
    pub session_id: String,
}

/// Client → server join request; echoed server → client with canonical
/// metadata on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationJoinPayload {
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSendPayload {
    pub conversation_id: String,
    pub client_msg_id: String,
    pub text: String,
}

/// Sent to the originator after the message is durable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAckPayload {
    pub conversation_id: String,
    pub client_msg_id: String,
    pub server_msg_id: String,
    pub seq: i64,
}

/// Fanned out to every subscriber of the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageNewPayload {
    pub conversation_id: String,
    pub client_msg_id: String,
    pub server_msg_id: String,
    pub seq: i64,
    pub sender_session_id: String,
    pub text: String,
    pub server_ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationHistoryFetchPayload {
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_seq: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationHistoryChunkPayload {
    pub conversation_id: String,
    pub messages: Vec<HistoryMessage>,
    pub has_more: bool,
}

/// One durable message as it appears in a history chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub seq: i64,
    pub server_msg_id: String,
    pub client_msg_id: String,
    pub sender_session_id: String,
    pub text: String,
    pub server_ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

// ── Time ─────────────────────────────────────────────────────────────────────

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
