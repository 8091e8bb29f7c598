//! Topic pub/sub on top of capability-filtered delivery.
//!
//! A topic is an action string: subscribing grants it to the caller's own
//! connection, publishing delivers to the connections of a key that hold it.
//!
//! - `{"action": "subscribe", "body": {"topic": "t"}}` (needs `subscribe`)
//! - `{"action": "publish", "body": {"key": "k", "topic": "t", "data": ...}}`
//!   (needs `publish`)

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use wshub_core::{encode, Command, HubError, HubResult};

use crate::client::Client;
use crate::handler::CommandHandler;
use crate::hub::Hub;

pub const SUBSCRIBE: &str = "subscribe";
pub const PUBLISH: &str = "publish";

#[derive(Debug, Deserialize)]
struct SubscribeBody {
    topic: String,
}

#[derive(Debug, Deserialize)]
struct PublishBody {
    key: String,
    topic: String,
    #[serde(default)]
    data: Value,
}

/// Demo command handler used by the binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct PubSub;

impl PubSub {
    async fn require(client: &Client, action: &str) -> HubResult<()> {
        if client.has_actions(&[action]).await {
            Ok(())
        } else {
            Err(HubError::AuthFailed(format!("action not permitted: {action}")))
        }
    }

    fn body<T: serde::de::DeserializeOwned>(body: Value) -> HubResult<T> {
        serde_json::from_value(body).map_err(|e| HubError::InvalidMessage(format!("invalid body: {e}")))
    }
}

#[async_trait]
impl CommandHandler for PubSub {
    async fn handle(&self, hub: &Hub, client: &Arc<Client>, command: Command) -> HubResult<()> {
        match command.action.as_str() {
            SUBSCRIBE => {
                Self::require(client, SUBSCRIBE).await?;
                let body: SubscribeBody = Self::body(command.body)?;
                hub.add_action_to_client(client.key(), &body.topic, client.id())
                    .await;
                debug!(topic = %body.topic, "subscribed");
                Ok(())
            }
            PUBLISH => {
                Self::require(client, PUBLISH).await?;
                let body: PublishBody = Self::body(command.body)?;
                let payload = encode(&body.data)?;
                let delivered = hub
                    .send_to_client(&body.key, None, payload, &[body.topic.as_str()])
                    .await;
                debug!(key = %body.key, topic = %body.topic, delivered, "published");
                Ok(())
            }
            other => Err(HubError::InvalidMessage(format!("unknown action: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use serde_json::json;
    use std::time::Duration;

    fn start() -> Hub {
        Hub::builder(TestAuth)
            .config(fast_config())
            .handler(PubSub)
            .start()
            .unwrap()
    }

    #[tokio::test]
    async fn subscribe_then_receive_publish() {
        let hub = start();
        let (mut reader, _) = connect(&hub, "reader").await;
        let (mut writer, _) = connect(&hub, "writer").await;
        login(&mut reader, &[SUBSCRIBE]).await;
        login(&mut writer, &[PUBLISH]).await;

        send_json(&mut reader, json!({"action": "subscribe", "body": {"topic": "news"}})).await;
        wait_until(|| async {
            hub.send_to_client("reader", None, b"{}".to_vec(), &["news"]).await == 1
        })
        .await;
        assert_eq!(recv_json(&mut reader).await, json!({}));

        send_json(
            &mut writer,
            json!({"action": "publish", "body": {"key": "reader", "topic": "news", "data": {"headline": "hi"}}}),
        )
        .await;
        assert_eq!(recv_json(&mut reader).await, json!({"headline": "hi"}));
        hub.close().await;
    }

    #[tokio::test]
    async fn publish_needs_capability() {
        let hub = start();
        let (mut peer, _) = connect(&hub, "u1").await;
        login(&mut peer, &[]).await;

        send_json(
            &mut peer,
            json!({"action": "publish", "body": {"key": "u1", "topic": "t", "data": 1}}),
        )
        .await;
        assert_eq!(
            recv_json(&mut peer).await,
            json!({"status": "auth", "msg": "action not permitted: publish"})
        );
        hub.close().await;
    }

    #[tokio::test]
    async fn bad_body_and_unknown_action() {
        let hub = start();
        let (mut peer, _) = connect(&hub, "u1").await;
        login(&mut peer, &[SUBSCRIBE]).await;

        send_json(&mut peer, json!({"action": "subscribe", "body": {"nope": 1}})).await;
        let reply = recv_json(&mut peer).await;
        assert_eq!(reply["status"], "invalid_msg");

        send_json(&mut peer, json!({"action": "dance"})).await;
        assert_eq!(
            recv_json(&mut peer).await,
            json!({"status": "invalid_msg", "msg": "unknown action: dance"})
        );
        assert!(try_recv_json(&mut peer, Duration::from_millis(100)).await.is_none());
        hub.close().await;
    }
}
