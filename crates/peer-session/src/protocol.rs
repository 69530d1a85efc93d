use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Operations a client may send.
pub const CLIENT_OPS: &[&str] = &["noise_init", "ping", "chat"];

/// A message from the client. Exactly one operation per message, selected
/// by the `op` field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientMessage {
    /// IK message 1, standard base64.
    NoiseInit { noise_init: String },

    Ping,

    Chat {
        #[serde(default)]
        model: Option<String>,
        prompt: String,
        /// Accepted for compatibility; chats over the data channel always
        /// stream.
        #[serde(default)]
        stream: Option<bool>,
    },
}

/// A message from the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The gateway's static Noise key, standard base64.
    NoisePubkey { public_key: String },

    /// IK message 2, standard base64.
    NoiseResponse { noise_response: String },

    #[serde(rename = "e2e_established")]
    E2eEstablished { e2e_established: bool },

    Pong,

    Delta { content: String },

    Done,

    Error { kind: ErrorKind, error: String },
}

impl ServerMessage {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            error: message.into(),
        }
    }
}

/// Machine-readable error category carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadJson,
    UnknownOp,
    InvalidMessage,
    HandshakeFailed,
    DecryptionFailed,
    AlreadyEstablished,
    NotSecure,
    BackendUnavailable,
    BackendDecode,
    MessageTooLarge,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadJson => "bad_json",
            Self::UnknownOp => "unknown_op",
            Self::InvalidMessage => "invalid_message",
            Self::HandshakeFailed => "handshake_failed",
            Self::DecryptionFailed => "decryption_failed",
            Self::AlreadyEstablished => "already_established",
            Self::NotSecure => "not_secure",
            Self::BackendUnavailable => "backend_unavailable",
            Self::BackendDecode => "backend_decode",
            Self::MessageTooLarge => "message_too_large",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad json: {0}")]
    BadJson(String),

    #[error("unknown op '{0}'")]
    UnknownOp(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadJson(_) => ErrorKind::BadJson,
            Self::UnknownOp(_) => ErrorKind::UnknownOp,
            Self::InvalidMessage(_) => ErrorKind::InvalidMessage,
        }
    }
}

/// Decode one client frame.
///
/// Decoding happens in two steps so that an unknown `op` is reported as such
/// rather than as a generic shape mismatch.
pub fn decode_client(bytes: &[u8]) -> Result<ClientMessage, ProtocolError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::BadJson(e.to_string()))?;

    let op = value
        .get("op")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::InvalidMessage("missing string field 'op'".into()))?;

    if !CLIENT_OPS.contains(&op) {
        return Err(ProtocolError::UnknownOp(op.to_string()));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
}

/// Encode a server message as JSON text.
pub fn encode_server(message: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
