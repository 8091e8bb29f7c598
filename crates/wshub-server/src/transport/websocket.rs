//! WebSocket upgrade listener using tokio-tungstenite.
//!
//! Accepts TCP connections, checks the request path, derives the logical key
//! from the upgrade request and hands the upgraded socket to the hub. Requests
//! are refused during the handshake, before any connection state exists:
//!
//! - 404 for any path other than the configured one
//! - 503 once the hub is closing
//! - 403 when the key extractor yields an empty key

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info};
use wshub_core::{HubError, HubResult};

use crate::hub::Hub;

/// Maps an upgrade request to a logical key. An empty key is refused.
pub type KeyFn = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// Where the logical key is read from.
///
/// Parsed from `query:<name>` or `header:<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Query string parameter.
    Query(String),
    /// Request header.
    Header(String),
}

impl FromStr for KeySource {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s
            .split_once(':')
            .ok_or_else(|| HubError::Config(format!("invalid key source: {s}")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(HubError::Config(format!("key source needs a name: {s}")));
        }
        match kind.trim() {
            "query" => Ok(KeySource::Query(name.to_string())),
            "header" => Ok(KeySource::Header(name.to_string())),
            other => Err(HubError::Config(format!("unknown key source kind: {other}"))),
        }
    }
}

impl KeySource {
    /// Read the key from `req`, or an empty string when absent.
    pub fn extract(&self, req: &Request) -> String {
        match self {
            KeySource::Query(name) => req
                .uri()
                .query()
                .unwrap_or_default()
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.trim().to_string())
                .unwrap_or_default(),
            KeySource::Header(name) => req
                .headers()
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .unwrap_or_default(),
        }
    }

    pub fn into_key_fn(self) -> KeyFn {
        Arc::new(move |req: &Request| self.extract(req))
    }
}

/// Settings for the upgrade endpoint.
#[derive(Clone)]
pub struct UpgradeOptions {
    /// Only this path is upgraded.
    pub path: String,
    pub key_fn: KeyFn,
    /// Largest inbound message and frame, in bytes.
    pub max_message_size: usize,
}

impl UpgradeOptions {
    pub fn new(path: impl Into<String>, key_fn: KeyFn, max_message_size: usize) -> Self {
        Self {
            path: path.into(),
            key_fn,
            max_message_size,
        }
    }

    fn ws_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }
}

/// Start the WebSocket listener.
///
/// Returns the bound address and the accept loop handle. Each accepted
/// connection is upgraded on its own task.
pub async fn start_listener(
    bind_addr: SocketAddr,
    hub: Hub,
    options: UpgradeOptions,
) -> HubResult<(SocketAddr, JoinHandle<()>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| HubError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, path = %options.path, "WebSocket listener started");

    let options = Arc::new(options);
    let handle = tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let hub = hub.clone();
                    let options = options.clone();
                    tokio::spawn(async move {
                        if let Err(e) = accept(stream, addr, &hub, &options).await {
                            debug!(remote = %addr, error = %e, "upgrade refused");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    });

    Ok((local_addr, handle))
}

async fn accept(
    stream: TcpStream,
    remote: SocketAddr,
    hub: &Hub,
    options: &UpgradeOptions,
) -> HubResult<()> {
    let mut key = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() != options.path {
            return Err(reject(StatusCode::NOT_FOUND, "not found"));
        }
        if hub.is_closed() {
            return Err(reject(StatusCode::SERVICE_UNAVAILABLE, "shutting down"));
        }
        let k = (options.key_fn)(req);
        if k.is_empty() {
            return Err(reject(StatusCode::FORBIDDEN, "forbidden"));
        }
        key = Some(k);
        Ok(resp)
    };

    let ws = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(options.ws_config()))
        .await
        .map_err(|e| HubError::Transport(format!("WebSocket handshake failed: {e}")))?;
    let key = key.ok_or_else(|| HubError::Transport("handshake produced no key".into()))?;

    let id = hub.serve_connection(ws, key.clone()).await?;
    info!(remote = %remote, key = %key, id = %id, "new client");
    Ok(())
}

fn reject(status: StatusCode, body: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(body.to_string()));
    *resp.status_mut() = status;
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fast_config, start_hub, GOOD_TOKEN};
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};

    async fn listen(hub: &Hub, source: KeySource) -> SocketAddr {
        let options = UpgradeOptions::new("/ws", source.into_key_fn(), 512);
        let (addr, _handle) = start_listener("127.0.0.1:0".parse().unwrap(), hub.clone(), options)
            .await
            .unwrap();
        addr
    }

    fn status_of(err: WsError) -> StatusCode {
        match err {
            WsError::Http(resp) => resp.status(),
            other => panic!("expected HTTP rejection, got {other}"),
        }
    }

    #[test]
    fn parses_key_sources() {
        assert_eq!(
            "query:key".parse::<KeySource>().unwrap(),
            KeySource::Query("key".into())
        );
        assert_eq!(
            "header:x-client-key".parse::<KeySource>().unwrap(),
            KeySource::Header("x-client-key".into())
        );
        assert!("cookie:key".parse::<KeySource>().is_err());
        assert!("query:".parse::<KeySource>().is_err());
        assert!("key".parse::<KeySource>().is_err());
    }

    #[test]
    fn extracts_query_parameter() {
        let req = Request::builder()
            .uri("/ws?foo=1&key=u1&bar=2")
            .body(())
            .unwrap();
        assert_eq!(KeySource::Query("key".into()).extract(&req), "u1");
        assert_eq!(KeySource::Query("missing".into()).extract(&req), "");
    }

    #[tokio::test]
    async fn upgrades_and_logs_in() {
        let hub = start_hub(fast_config());
        let addr = listen(&hub, KeySource::Query("key".into())).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?key=u1"))
            .await
            .unwrap();
        let login = serde_json::json!({"token": GOOD_TOKEN, "actions": ["a"]});
        ws.send(Message::Text(login.to_string())).await.unwrap();

        let reply = loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => break serde_json::from_str::<serde_json::Value>(&text).unwrap(),
                _ => continue,
            }
        };
        assert_eq!(reply["login"], true);
        assert_eq!(hub.stats().await.authenticated, 1);
        hub.close().await;
    }

    #[tokio::test]
    async fn missing_key_is_forbidden() {
        let hub = start_hub(fast_config());
        let addr = listen(&hub, KeySource::Query("key".into())).await;

        let err = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap_err();
        assert_eq!(status_of(err), StatusCode::FORBIDDEN);

        let err = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?key="))
            .await
            .unwrap_err();
        assert_eq!(status_of(err), StatusCode::FORBIDDEN);
        assert_eq!(hub.stats().await.connections, 0);
        hub.close().await;
    }

    #[tokio::test]
    async fn wrong_path_is_not_found() {
        let hub = start_hub(fast_config());
        let addr = listen(&hub, KeySource::Query("key".into())).await;

        let err = tokio_tungstenite::connect_async(format!("ws://{addr}/other?key=u1"))
            .await
            .unwrap_err();
        assert_eq!(status_of(err), StatusCode::NOT_FOUND);
        hub.close().await;
    }

    #[tokio::test]
    async fn closed_hub_is_unavailable() {
        let hub = start_hub(fast_config());
        let addr = listen(&hub, KeySource::Query("key".into())).await;
        hub.close().await;

        let err = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?key=u1"))
            .await
            .unwrap_err();
        assert_eq!(status_of(err), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn header_key_source() {
        let hub = start_hub(fast_config());
        let addr = listen(&hub, KeySource::Header("x-client-key".into())).await;

        let mut req = format!("ws://{addr}/ws").into_client_request().unwrap();
        req.headers_mut()
            .insert("x-client-key", HeaderValue::from_static("u9"));
        let (_ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();

        crate::testutil::wait_until(|| async { hub.stats().await.keys == 1 }).await;
        hub.close().await;
    }

    #[tokio::test]
    async fn oversized_message_drops_connection() {
        let hub = start_hub(fast_config());
        let addr = listen(&hub, KeySource::Query("key".into())).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?key=u1"))
            .await
            .unwrap();
        crate::testutil::wait_until(|| async { hub.stats().await.connections == 1 }).await;

        ws.send(Message::Text("x".repeat(2048))).await.unwrap();
        crate::testutil::wait_until(|| async { hub.stats().await.connections == 0 }).await;
        hub.close().await;
    }
}
