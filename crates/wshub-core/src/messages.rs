//! Wire envelopes exchanged with connected peers.
//!
//! # Client → Server
//!
//! - login: `{"token": "...", "actions": ["..."]}` (first message on a connection)
//! - command: `{"action": "...", "body": <json>}`
//!
//! # Server → Client
//!
//! - login ack: `{"login": true, "uuid": "<connection id>"}`
//! - error: `{"status": "<code>", "msg": "<message>"}`

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Peer-visible failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "invalid_msg")]
    InvalidMsg,
    #[serde(rename = "max connections")]
    MaxConnections,
    #[serde(rename = "auth")]
    Auth,
    #[serde(rename = "undefined")]
    Undefined,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidMsg => "invalid_msg",
            ErrorCode::MaxConnections => "max connections",
            ErrorCode::Auth => "auth",
            ErrorCode::Undefined => "undefined",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure signalled to one peer. Never mutates the registry by itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerError {
    pub code: ErrorCode,
    pub message: String,
    /// Logical key of the connection the error is addressed to.
    pub key: String,
}

/// Serialized shape of [`PeerError`] on the wire; the key stays server-side.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub status: ErrorCode,
    pub msg: String,
}

impl PeerError {
    pub fn new(code: ErrorCode, message: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            key: key.into(),
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            status: self.code,
            msg: self.message.clone(),
        }
    }
}

/// Acknowledgement unicast to a connection after a successful login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginAck {
    pub login: bool,
    pub uuid: Uuid,
}

impl LoginAck {
    pub fn new(id: Uuid) -> Self {
        Self { login: true, uuid: id }
    }
}

/// Login request: credential plus the capabilities the connection asks for.
///
/// `key` and `id` are never read from the wire; they are stamped by the read
/// pump of the connection the frame arrived on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginMessage {
    pub token: String,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(skip)]
    pub key: String,
    #[serde(skip)]
    pub id: Uuid,
}

impl LoginMessage {
    pub fn tag(&mut self, key: &str, id: Uuid) {
        self.key = key.to_string();
        self.id = id;
    }
}

/// Application command sent after login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub action: String,
    #[serde(default)]
    pub body: Value,
}

/// Every frame a peer may send. Decided by shape: `token` ⇒ login,
/// `action` ⇒ command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
    Login(LoginMessage),
    Command(Command),
}
