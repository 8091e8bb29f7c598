//! Per-connection read and write pumps.
//!
//! Each connection runs three tasks on the hub's tracker:
//!
//! - a supervisor that owns the two pump handles and tears the connection
//!   down as soon as either pump ends,
//! - the read pump, the only reader of the socket,
//! - the write pump, the only writer of the socket,
//!
//! plus a login-deadline watcher. All of them stop once the client enters
//! [`ClientState::Closing`].

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, trace, warn, Instrument};
use wshub_core::{decode_inbound, ErrorCode, Inbound};

use super::{Client, ClientState};
use crate::hub::{panic_message, Hub};

/// Time allowed to flush queued frames and the close frame on shutdown.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Why the write loop stopped.
enum Stop {
    /// Close was requested; the socket is still usable.
    Closing,
    /// The socket failed or a write was abandoned.
    Failed,
}

/// Spawn the tasks that serve `client` over `ws`.
pub(crate) fn start<S>(
    hub: &Hub,
    client: Arc<Client>,
    ws: WebSocketStream<S>,
    rx: mpsc::Receiver<Vec<u8>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    let span = client.span().clone();
    let tracker = hub.tracker();

    tracker.spawn(
        auth_deadline(client.clone(), hub.config().auth_timeout).instrument(span.clone()),
    );

    let read = tokio::spawn(read_pump(hub.clone(), client.clone(), stream).instrument(span.clone()));
    let write = tokio::spawn(write_pump(hub.clone(), client.clone(), sink, rx).instrument(span.clone()));

    tracker.spawn(supervise(client, read, write).instrument(span));
}

async fn supervise(
    client: Arc<Client>,
    mut read: tokio::task::JoinHandle<()>,
    mut write: tokio::task::JoinHandle<()>,
) {
    let (first, res) = tokio::select! {
        r = &mut read => ("read", r),
        w = &mut write => ("write", w),
    };
    log_exit(first, res);

    client.close();
    client.request_unregister();

    match first {
        "read" => log_exit("write", write.await),
        _ => log_exit("read", read.await),
    }
    client.finish();
    debug!("connection released");
}

fn log_exit(pump: &str, res: Result<(), JoinError>) {
    match res {
        Ok(()) => trace!(pump, "pump exited"),
        Err(e) if e.is_panic() => {
            error!(pump, panic = %panic_message(&*e.into_panic()), "pump panicked")
        }
        Err(e) => debug!(pump, error = %e, "pump aborted"),
    }
}

/// Resolve once the client starts closing.
async fn until_closing(state: &mut watch::Receiver<ClientState>) {
    let _ = state.wait_for(|s| s.is_closing()).await;
}

/// Unregister a connection that has not logged in within `limit`.
async fn auth_deadline(client: Arc<Client>, limit: Duration) {
    let mut state = client.subscribe_state();
    let expired = tokio::time::timeout(
        limit,
        state.wait_for(|s| *s == ClientState::Active || s.is_closing()),
    )
    .await
    .is_err();

    if expired && !client.is_authenticated() {
        warn!(timeout = ?limit, "login deadline exceeded");
        client.request_unregister();
    }
}

async fn read_pump<S>(hub: Hub, client: Arc<Client>, mut stream: SplitStream<WebSocketStream<S>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let pong_wait = hub.config().pong_wait;
    let mut state = client.subscribe_state();
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let next = tokio::select! {
            _ = until_closing(&mut state) => break,
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };

        let msg = match next {
            Err(_) => {
                debug!("read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "read failed");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => dispatch(&hub, &client, text.as_bytes()).await,
            Message::Binary(data) => dispatch(&hub, &client, &data).await,
            Message::Pong(_) => deadline = Instant::now() + pong_wait,
            Message::Close(frame) => {
                debug!(?frame, "peer closed");
                break;
            }
            _ => {}
        }
    }
}

/// Handle one inbound frame. A panic here is logged and the connection
/// keeps reading.
async fn dispatch(hub: &Hub, client: &Arc<Client>, data: &[u8]) {
    let handled = AssertUnwindSafe(handle_frame(hub, client, data))
        .catch_unwind()
        .await;
    if let Err(panic) = handled {
        error!(panic = %panic_message(&*panic), "frame handler panicked");
    }
}

async fn handle_frame(hub: &Hub, client: &Arc<Client>, data: &[u8]) {
    let inbound = match decode_inbound(data) {
        Ok(inbound) => inbound,
        Err(e) => {
            debug!(error = %e, "rejected frame");
            let _ = client
                .send_error(ErrorCode::InvalidMsg, "invalid body or action")
                .await;
            return;
        }
    };

    match inbound {
        Inbound::Login(mut login) => {
            login.tag(client.key(), client.id());
            hub.submit_login(login).await;
        }
        Inbound::Command(command) => {
            if !client.is_authenticated() {
                let _ = client.send_error(ErrorCode::InvalidMsg, "login required").await;
                return;
            }
            let action = command.action.clone();
            if let Err(e) = hub.dispatch_command(client, command).await {
                debug!(action = %action, error = %e, "command failed");
                let _ = client.send_error(e.code(), e.peer_message()).await;
            }
        }
    }
}

async fn write_pump<S>(
    hub: Hub,
    client: Arc<Client>,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<Vec<u8>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let cfg = hub.config();
    let write_wait = cfg.write_wait;
    let mut state = client.subscribe_state();
    let mut ping = tokio::time::interval_at(Instant::now() + cfg.ping_period(), cfg.ping_period());
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let stop = loop {
        let msg = tokio::select! {
            biased;
            _ = until_closing(&mut state) => break Stop::Closing,
            payload = rx.recv() => match payload {
                Some(payload) => frame(payload),
                None => break Stop::Closing,
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        let sent = tokio::select! {
            res = tokio::time::timeout(write_wait, sink.send(msg)) => res,
            _ = until_closing(&mut state) => {
                debug!("write abandoned on close");
                break Stop::Failed;
            }
        };
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "write failed");
                break Stop::Failed;
            }
            Err(_) => {
                debug!(timeout = ?write_wait, "write deadline exceeded");
                break Stop::Failed;
            }
        }
    };

    client.close();
    rx.close();

    let flushed = tokio::time::timeout(CLOSE_GRACE, async {
        if let Stop::Closing = stop {
            while let Some(payload) = rx.recv().await {
                sink.feed(frame(payload)).await?;
            }
        }
        sink.close().await
    })
    .await;
    match flushed {
        Ok(Ok(())) => trace!("close frame sent"),
        Ok(Err(e)) => trace!(error = %e, "close failed"),
        Err(_) => trace!("close grace exceeded"),
    }
}

/// Payloads go out as text frames when they are valid UTF-8.
fn frame(payload: Vec<u8>) -> Message {
    match String::from_utf8(payload) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}
