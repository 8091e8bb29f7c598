//! Application hook for post-login commands.

use async_trait::async_trait;
use std::sync::Arc;
use wshub_core::{Command, HubResult};

use crate::client::Client;
use crate::hub::Hub;

/// Handles `{"action": ..., "body": ...}` frames from logged-in connections.
///
/// Runs on the sending connection's read pump, so a slow handler delays
/// further reads on that connection only. An `Err` is reported back to the
/// sender as an error envelope using the error's code.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, hub: &Hub, client: &Arc<Client>, command: Command) -> HubResult<()>;
}
