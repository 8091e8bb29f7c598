use thiserror::Error;

use crate::messages::ErrorCode;

/// Errors produced by the hub and its protocol layer.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("max connections {0}")]
    MaxConnections(usize),

    #[error("outbound queue full")]
    Backpressure,

    #[error("connection closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl HubError {
    /// Peer-visible code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            HubError::Codec(_) | HubError::InvalidMessage(_) => ErrorCode::InvalidMsg,
            HubError::AuthFailed(_) => ErrorCode::Auth,
            HubError::MaxConnections(_) => ErrorCode::MaxConnections,
            _ => ErrorCode::Undefined,
        }
    }

    /// Message shown to the peer. Unlike `Display`, carries no variant prefix.
    pub fn peer_message(&self) -> String {
        match self {
            HubError::Codec(m)
            | HubError::InvalidMessage(m)
            | HubError::AuthFailed(m)
            | HubError::Other(m) => m.clone(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::Codec(e.to_string())
    }
}

pub type HubResult<T> = Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_variant() {
        assert_eq!(HubError::InvalidMessage("x".into()).code(), ErrorCode::InvalidMsg);
        assert_eq!(HubError::AuthFailed("bad token".into()).code(), ErrorCode::Auth);
        assert_eq!(HubError::MaxConnections(10).code(), ErrorCode::MaxConnections);
        assert_eq!(HubError::Backpressure.code(), ErrorCode::Undefined);
        assert_eq!(HubError::Closed.code(), ErrorCode::Undefined);
    }

    #[test]
    fn peer_message_strips_prefix() {
        assert_eq!(HubError::AuthFailed("bad token".into()).peer_message(), "bad token");
        assert_eq!(HubError::MaxConnections(10).peer_message(), "max connections 10");
    }
}
