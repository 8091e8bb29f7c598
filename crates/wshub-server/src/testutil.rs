//! Shared helpers for in-crate tests: a toy authenticator, fast hub limits,
//! and in-memory peers.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;
use wshub_core::{HubError, HubResult, LoginMessage};

use crate::auth::{Authenticator, ClientContext};
use crate::config::HubConfig;
use crate::hub::Hub;

pub(crate) const GOOD_TOKEN: &str = "good";
const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Accepts [`GOOD_TOKEN`] with any actions.
pub(crate) struct TestAuth;

#[async_trait]
impl Authenticator for TestAuth {
    async fn login(&self, ctx: ClientContext, msg: &LoginMessage) -> HubResult<ClientContext> {
        if msg.token == GOOD_TOKEN {
            Ok(ctx.with_claim("subject", msg.key.clone()))
        } else {
            Err(HubError::AuthFailed("bad token".into()))
        }
    }
}

pub(crate) fn fast_config() -> HubConfig {
    HubConfig {
        send_timeout: Duration::from_millis(200),
        auth_timeout: Duration::from_secs(10),
        pong_wait: Duration::from_secs(10),
        write_wait: Duration::from_secs(1),
        ..HubConfig::default()
    }
}

pub(crate) fn start_hub(config: HubConfig) -> Hub {
    Hub::builder(TestAuth).config(config).start().unwrap()
}

pub(crate) type Peer = WebSocketStream<DuplexStream>;

/// Attach an in-memory peer to the hub under `key`.
pub(crate) async fn connect(hub: &Hub, key: &str) -> (Peer, Uuid) {
    connect_with_buffer(hub, key, 64 * 1024).await
}

pub(crate) async fn connect_with_buffer(hub: &Hub, key: &str, buffer: usize) -> (Peer, Uuid) {
    let (server, client) = tokio::io::duplex(buffer);
    let server_ws = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
    let peer = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
    let id = hub.serve_connection(server_ws, key).await.unwrap();
    (peer, id)
}

pub(crate) async fn send_json(peer: &mut Peer, value: Value) {
    peer.send(Message::Text(value.to_string())).await.unwrap();
}

pub(crate) async fn send_text(peer: &mut Peer, text: &str) {
    peer.send(Message::Text(text.to_string())).await.unwrap();
}

/// Next text frame as JSON, skipping keepalives.
pub(crate) async fn recv_json(peer: &mut Peer) -> Value {
    try_recv_json(peer, RECV_TIMEOUT)
        .await
        .expect("no frame before timeout")
}

/// Next text frame within `limit`, or `None`.
pub(crate) async fn try_recv_json(peer: &mut Peer, limit: Duration) -> Option<Value> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let next = tokio::time::timeout_at(deadline, peer.next()).await.ok()?;
        match next {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

/// Log in with [`GOOD_TOKEN`] and return the acknowledged connection id.
pub(crate) async fn login(peer: &mut Peer, actions: &[&str]) -> Uuid {
    send_json(peer, serde_json::json!({"token": GOOD_TOKEN, "actions": actions})).await;
    let ack = recv_json(peer).await;
    assert_eq!(ack["login"], true, "unexpected reply {ack}");
    ack["uuid"].as_str().unwrap().parse().unwrap()
}

/// Read until the server closes the socket. Panics on data frames.
pub(crate) async fn expect_closed(peer: &mut Peer) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        match tokio::time::timeout_at(deadline, peer.next()).await {
            Err(_) => panic!("socket still open"),
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return,
            Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
            Ok(Some(Ok(other))) => panic!("expected close, got {other:?}"),
        }
    }
}

/// Poll `check` until it holds or a few seconds pass.
pub(crate) async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
