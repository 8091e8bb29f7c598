//! Login authorization: the injected [`Authenticator`] and the
//! configuration-driven [`StaticTokenAuthenticator`].
//!
//! The hub never decides whether a login is accepted. It hands the tagged
//! [`LoginMessage`] and the connection's current [`ClientContext`] to the
//! authenticator and acts only on the result: `Ok(ctx)` installs the
//! requested actions and `ctx` on the connection, `Err(e)` is reported to the
//! peer as an `auth` error.

pub mod tokens;

use async_trait::async_trait;
use std::collections::BTreeMap;
use wshub_core::{HubResult, LoginMessage};

pub use tokens::StaticTokenAuthenticator;

/// Per-connection values installed by a successful login.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientContext {
    pub claims: BTreeMap<String, String>,
}

impl ClientContext {
    pub fn with_claim(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.insert(name.into(), value.into());
        self
    }

    pub fn claim(&self, name: &str) -> Option<&str> {
        self.claims.get(name).map(String::as_str)
    }
}

/// Decides whether a login is accepted.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Return the context to install on acceptance, or an error to reject.
    async fn login(&self, ctx: ClientContext, msg: &LoginMessage) -> HubResult<ClientContext>;
}
