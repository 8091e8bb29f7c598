//! One physical connection: identity, capabilities, outbound queue, and the
//! lifecycle guard shared by its pumps.
//!
//! The registry entry for a client is owned by the hub; socket I/O is owned
//! by the two pumps in [`pump`]. The only state the pumps share is the
//! outbound queue and the lifecycle `watch` channel, whose transition to
//! [`ClientState::Closing`] is the one-shot close guard.

pub(crate) mod pump;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info_span, warn, Span};
use uuid::Uuid;
use wshub_core::{error_frame, ErrorCode, HubError, HubResult, PeerError};

use crate::auth::ClientContext;

/// Lifecycle of a connection. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Created at upgrade, registration not yet processed.
    Connecting,
    /// Registered, waiting for a successful login.
    Authenticating,
    /// Logged in.
    Active,
    /// Close requested; pumps are winding down.
    Closing,
    /// Both pumps have exited and the socket is released.
    Closed,
}

impl ClientState {
    pub fn is_closing(self) -> bool {
        matches!(self, ClientState::Closing | ClientState::Closed)
    }
}

/// Server-side handle for one live socket.
pub struct Client {
    key: String,
    id: Uuid,
    authed: AtomicBool,
    actions: RwLock<Vec<String>>,
    context: RwLock<ClientContext>,
    tx: mpsc::Sender<Vec<u8>>,
    send_timeout: Duration,
    state: watch::Sender<ClientState>,
    unregister: mpsc::Sender<Arc<Client>>,
    span: Span,
}

impl Client {
    /// Create a client and the receiving end of its outbound queue.
    pub(crate) fn new(
        key: String,
        queue_capacity: usize,
        send_timeout: Duration,
        unregister: mpsc::Sender<Arc<Client>>,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(queue_capacity);
        let span = info_span!("client", key = %key, id = %id);
        let client = Arc::new(Self {
            key,
            id,
            authed: AtomicBool::new(false),
            actions: RwLock::new(Vec::new()),
            context: RwLock::new(ClientContext::default()),
            tx,
            send_timeout,
            state: watch::channel(ClientState::Connecting).0,
            unregister,
            span,
        });
        (client, rx)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authed.load(Ordering::Acquire)
    }

    pub fn is_closing(&self) -> bool {
        self.state().is_closing()
    }

    /// Snapshot of the granted actions.
    pub async fn actions(&self) -> Vec<String> {
        self.actions.read().await.clone()
    }

    pub async fn context(&self) -> ClientContext {
        self.context.read().await.clone()
    }

    /// True when every action in `required` has been granted. An empty
    /// requirement always passes; a non-empty one also needs a login.
    pub async fn has_actions<A: AsRef<str>>(&self, required: &[A]) -> bool {
        if required.is_empty() {
            return true;
        }
        if !self.is_authenticated() {
            return false;
        }
        let granted = self.actions.read().await;
        required
            .iter()
            .all(|r| granted.iter().any(|g| g == r.as_ref()))
    }

    /// Enqueue a payload for the write pump.
    ///
    /// Waits at most `send_timeout` for queue space. On timeout the peer is
    /// treated as unresponsive: the client requests its own unregistration
    /// and the caller gets [`HubError::Backpressure`].
    pub async fn send(self: &Arc<Self>, payload: Vec<u8>) -> HubResult<()> {
        if self.is_closing() {
            return Err(HubError::Closed);
        }
        match tokio::time::timeout(self.send_timeout, self.tx.send(payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(HubError::Closed),
            Err(_) => {
                warn!(parent: &self.span, "send timeout");
                self.request_unregister();
                Err(HubError::Backpressure)
            }
        }
    }

    /// Send an `{"status": ..., "msg": ...}` error envelope to this peer.
    pub async fn send_error(self: &Arc<Self>, code: ErrorCode, message: impl Into<String>) -> HubResult<()> {
        let err = PeerError::new(code, message, self.key.clone());
        self.send(error_frame(&err)).await
    }

    /// Ask the hub to remove this client. Never blocks the caller.
    pub(crate) fn request_unregister(self: &Arc<Self>) {
        match self.unregister.try_send(self.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(client)) => {
                let tx = self.unregister.clone();
                tokio::spawn(async move {
                    let _ = tx.send(client).await;
                });
            }
            Err(TrySendError::Closed(_)) => {
                debug!(parent: &self.span, "hub stopped, closing directly");
                self.close();
            }
        }
    }

    /// Install the result of a successful login. Actions are in place before
    /// the auth flag flips.
    pub(crate) async fn install_login(&self, actions: Vec<String>, ctx: ClientContext) {
        *self.actions.write().await = actions;
        *self.context.write().await = ctx;
        self.authed.store(true, Ordering::Release);
        self.state.send_if_modified(|s| match s {
            ClientState::Connecting | ClientState::Authenticating => {
                *s = ClientState::Active;
                true
            }
            _ => false,
        });
    }

    /// Grant one more action. Returns `false` if it was already held.
    pub(crate) async fn grant(&self, action: &str) -> bool {
        let mut actions = self.actions.write().await;
        if actions.iter().any(|a| a == action) {
            return false;
        }
        actions.push(action.to_string());
        true
    }

    pub(crate) fn mark_registered(&self) {
        self.state.send_if_modified(|s| {
            if *s == ClientState::Connecting {
                *s = ClientState::Authenticating;
                true
            } else {
                false
            }
        });
    }

    /// One-shot close guard. Returns `true` only for the caller that moved
    /// the client into `Closing`; every later call is a no-op.
    pub(crate) fn close(&self) -> bool {
        let first = self.state.send_if_modified(|s| {
            if s.is_closing() {
                false
            } else {
                *s = ClientState::Closing;
                true
            }
        });
        if first {
            debug!(parent: &self.span, "closing connection");
        }
        first
    }

    /// Called once both pumps have exited.
    pub(crate) fn finish(&self) {
        self.state.send_replace(ClientState::Closed);
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    /// Resolve once the socket has been released.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ClientState::Closed).await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("authed", &self.is_authenticated())
            .field("state", &self.state())
            .finish()
    }
}
