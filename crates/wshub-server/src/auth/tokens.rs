//! Token table authenticator backed by the `[auth.tokens]` config section.

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;
use wshub_core::{HubError, HubResult, LoginMessage};

use super::{Authenticator, ClientContext};
use crate::config::TokenGrant;

/// Action wildcard in a grant: any requested action is allowed.
const ANY_ACTION: &str = "*";

/// Accepts logins whose token is listed in the table and whose requested
/// actions are all covered by that token's grant.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, TokenGrant>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, TokenGrant>) -> Self {
        Self { tokens }
    }

    /// Number of configured tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn check(&self, msg: &LoginMessage) -> HubResult<()> {
        let grant = self
            .tokens
            .get(&msg.token)
            .ok_or_else(|| HubError::AuthFailed("invalid token".into()))?;

        if let Some(ref key) = grant.key {
            if key != &msg.key {
                return Err(HubError::AuthFailed("token not valid for this key".into()));
            }
        }

        if grant.actions.iter().any(|a| a == ANY_ACTION) {
            return Ok(());
        }
        if let Some(denied) = msg.actions.iter().find(|a| !grant.actions.contains(a)) {
            return Err(HubError::AuthFailed(format!("action not permitted: {denied}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn login(&self, ctx: ClientContext, msg: &LoginMessage) -> HubResult<ClientContext> {
        self.check(msg)?;
        debug!(key = %msg.key, actions = ?msg.actions, "token accepted");
        Ok(ctx.with_claim("subject", msg.key.clone()))
    }
}
