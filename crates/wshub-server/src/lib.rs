//! wshub-server: WebSocket connection hub.
//!
//! Keeps many long-lived WebSocket connections per logical key, gates them
//! behind a login handshake decided by an injected [`Authenticator`], and
//! delivers targeted messages to the connections holding the right actions.

pub mod auth;
pub mod client;
pub mod config;
pub mod handler;
pub mod hub;
pub mod metrics;
pub mod pubsub;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use auth::{Authenticator, ClientContext, StaticTokenAuthenticator};
pub use client::{Client, ClientState};
pub use config::{ConfigOverrides, HubConfig, ServerConfig};
pub use handler::CommandHandler;
pub use hub::{Hub, HubBuilder, HubStats, NO_ACTIONS};
pub use metrics::HubMetrics;
pub use pubsub::PubSub;
pub use transport::websocket::{start_listener, KeyFn, KeySource, UpgradeOptions};
