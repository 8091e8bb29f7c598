//! wshub-core: Shared protocol library for the wshub connection hub.
//!
//! Provides the JSON envelopes exchanged with peers, peer-visible error
//! codes, the frame codec, and the hub error type.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode, decode_inbound, encode, error_frame, login_ack_frame};
pub use error::{HubError, HubResult};
pub use messages::{Command, ErrorCode, Inbound, LoginAck, LoginMessage, PeerError};
