//! JSON framing for hub envelopes.
//!
//! One WebSocket text frame carries exactly one JSON document.

use crate::error::{HubError, HubResult};
use crate::messages::{Inbound, LoginAck, PeerError};
use uuid::Uuid;

/// Encode a serializable value into a frame payload.
pub fn encode<T: serde::Serialize>(value: &T) -> HubResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode a frame payload into a typed value.
pub fn decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> HubResult<T> {
    Ok(serde_json::from_slice(data)?)
}

/// Decode an inbound frame, folding newlines into spaces and trimming
/// surrounding whitespace first.
pub fn decode_inbound(data: &[u8]) -> HubResult<Inbound> {
    let folded: Vec<u8> = data
        .iter()
        .map(|b| if *b == b'\n' { b' ' } else { *b })
        .collect();
    let trimmed = folded.trim_ascii();
    if trimmed.is_empty() {
        return Err(HubError::InvalidMessage("empty frame".into()));
    }
    serde_json::from_slice(trimmed)
        .map_err(|e| HubError::InvalidMessage(format!("invalid body or action: {e}")))
}

/// Frame for a peer error: `{"status": ..., "msg": ...}`.
pub fn error_frame(err: &PeerError) -> Vec<u8> {
    serde_json::to_vec(&err.envelope()).unwrap_or_default()
}

/// Frame for a login acknowledgement: `{"login": true, "uuid": ...}`.
pub fn login_ack_frame(id: Uuid) -> Vec<u8> {
    serde_json::to_vec(&LoginAck::new(id)).unwrap_or_default()
}
