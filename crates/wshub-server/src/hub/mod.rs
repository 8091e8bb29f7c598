//! The connection hub.
//!
//! Owns the registry of live connections keyed by logical identity.
//! Registration, unregistration and login are serialized through one event
//! loop; targeted delivery and capability grants can be called from any
//! task and only take the registry lock long enough to pick their targets.

pub mod registry;

use futures_util::future::join_all;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wshub_core::{login_ack_frame, Command, ErrorCode, HubError, HubResult, LoginMessage};

use crate::auth::Authenticator;
use crate::client::{pump, Client};
use crate::config::HubConfig;
use crate::handler::CommandHandler;
use crate::metrics::HubMetrics;
use registry::Registry;

/// Empty capability requirement for [`Hub::send_to_client`].
pub const NO_ACTIONS: &[&str] = &[];

/// Counts taken from the registry at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Keys with at least one connection.
    pub keys: usize,
    /// Live connections.
    pub connections: usize,
    /// Live connections that have logged in.
    pub authenticated: usize,
}

/// Senders feeding the event loop.
struct HubEvents {
    register: mpsc::Sender<Arc<Client>>,
    unregister: mpsc::Sender<Arc<Client>>,
    login: mpsc::Sender<LoginMessage>,
}

/// Receivers owned by the event loop.
struct EventQueues {
    register: mpsc::Receiver<Arc<Client>>,
    unregister: mpsc::Receiver<Arc<Client>>,
    login: mpsc::Receiver<LoginMessage>,
}

struct HubInner {
    /// Limits applied to every connection.
    config: HubConfig,
    /// Key → connections. Only the event loop inserts or removes.
    registry: RwLock<Registry>,
    /// Decides logins.
    authenticator: Arc<dyn Authenticator>,
    /// Handles post-login commands, if any.
    handler: Option<Arc<dyn CommandHandler>>,
    /// Active-connection gauge.
    metrics: HubMetrics,
    events: HubEvents,
    /// Every connection task; waited on at shutdown.
    tracker: TaskTracker,
    /// Set once `close` starts; new connections are refused.
    closed: AtomicBool,
    /// Held shared while a connection is admitted, exclusively while `close`
    /// flips `closed`. No connection starts its tasks after `close` begins.
    admission: RwLock<()>,
    /// Stops the event loop.
    shutdown_tx: broadcast::Sender<()>,
    /// Event loop handle, taken by the first `close`.
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to a running hub.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

/// Configures and starts a [`Hub`].
pub struct HubBuilder {
    config: HubConfig,
    authenticator: Arc<dyn Authenticator>,
    handler: Option<Arc<dyn CommandHandler>>,
}

impl HubBuilder {
    pub fn config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    /// Install the handler for `{"action", "body"}` commands.
    pub fn handler(mut self, handler: impl CommandHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Validate the configuration and spawn the event loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> HubResult<Hub> {
        self.config.validate()?;
        let capacity = self.config.event_capacity;
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
        let (login_tx, login_rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let hub = Hub {
            inner: Arc::new(HubInner {
                config: self.config,
                registry: RwLock::new(Registry::new()),
                authenticator: self.authenticator,
                handler: self.handler,
                metrics: HubMetrics::new()?,
                events: HubEvents {
                    register: register_tx,
                    unregister: unregister_tx,
                    login: login_tx,
                },
                tracker: TaskTracker::new(),
                closed: AtomicBool::new(false),
                admission: RwLock::new(()),
                shutdown_tx,
                event_loop: Mutex::new(None),
            }),
        };

        let queues = EventQueues {
            register: register_rx,
            unregister: unregister_rx,
            login: login_rx,
        };
        let handle = tokio::spawn(hub.clone().run(queues, shutdown_rx));
        // Nothing else can hold the lock yet.
        if let Ok(mut slot) = hub.inner.event_loop.try_lock() {
            *slot = Some(handle);
        }

        info!(
            max_connections_per_key = hub.inner.config.max_connections_per_key,
            "hub started"
        );
        Ok(hub)
    }
}

impl Hub {
    pub fn builder(authenticator: impl Authenticator) -> HubBuilder {
        HubBuilder {
            config: HubConfig::default(),
            authenticator: Arc::new(authenticator),
            handler: None,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &HubMetrics {
        &self.inner.metrics
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.inner.tracker
    }

    /// Attach an upgraded socket under `key`.
    ///
    /// The connection is queued for registration before its pumps start.
    /// Returns the new connection id.
    pub async fn serve_connection<S>(&self, ws: WebSocketStream<S>, key: impl Into<String>) -> HubResult<Uuid>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let _admitted = self.inner.admission.read().await;
        if self.is_closed() {
            return Err(HubError::Closed);
        }
        let key = key.into();
        if key.is_empty() {
            return Err(HubError::InvalidMessage("empty key".into()));
        }

        let cfg = &self.inner.config;
        let (client, rx) = Client::new(
            key,
            cfg.queue_capacity,
            cfg.send_timeout,
            self.inner.events.unregister.clone(),
        );
        let id = client.id();
        self.inner
            .events
            .register
            .send(client.clone())
            .await
            .map_err(|_| HubError::Closed)?;
        pump::start(self, client, ws, rx);
        Ok(id)
    }

    /// Queue removal of a connection. Safe to call any number of times.
    pub async fn unregister(&self, client: &Arc<Client>) {
        if self.inner.events.unregister.send(client.clone()).await.is_err() {
            client.close();
        }
    }

    /// Deliver `body` to the connections of `key` (or only connection `id`)
    /// whose actions cover `required`. Returns how many accepted it.
    pub async fn send_to_client<A: AsRef<str>>(
        &self,
        key: &str,
        id: Option<Uuid>,
        body: Vec<u8>,
        required: &[A],
    ) -> usize {
        let targets = {
            let registry = self.inner.registry.read().await;
            if !registry.contains_key(key) {
                warn!(key, "send to unknown key");
                return 0;
            }
            let mut targets = Vec::new();
            for client in registry.connections(key) {
                if id.is_some_and(|id| client.id() != id) {
                    continue;
                }
                if client.has_actions(required).await {
                    targets.push(client.clone());
                }
            }
            targets
        };

        if targets.is_empty() {
            debug!(key, ?id, "no eligible connection");
            return 0;
        }
        let sends = targets.iter().map(|c| c.send(body.clone()));
        join_all(sends).await.into_iter().filter(Result::is_ok).count()
    }

    /// Grant `action` to every connection of `key`. Returns how many
    /// connections did not already hold it.
    pub async fn add_action_to_clients(&self, key: &str, action: &str) -> usize {
        let clients = self.inner.registry.read().await.connections(key).to_vec();
        let mut granted = 0;
        for client in &clients {
            if client.grant(action).await {
                granted += 1;
            }
        }
        debug!(key, action, granted, "action granted");
        granted
    }

    /// Grant `action` to connection `id` of `key`. Returns `false` if the
    /// connection is unknown or already held it.
    pub async fn add_action_to_client(&self, key: &str, action: &str, id: Uuid) -> bool {
        let client = self.inner.registry.read().await.find(key, id);
        match client {
            Some(client) => client.grant(action).await,
            None => {
                debug!(key, %id, "grant to unknown connection");
                false
            }
        }
    }

    pub async fn stats(&self) -> HubStats {
        let registry = self.inner.registry.read().await;
        let all = registry.all();
        HubStats {
            keys: registry.key_count(),
            connections: all.len(),
            authenticated: all.iter().filter(|c| c.is_authenticated()).count(),
        }
    }

    pub(crate) async fn find_client(&self, key: &str, id: Uuid) -> Option<Arc<Client>> {
        self.inner.registry.read().await.find(key, id)
    }

    /// Shut the hub down.
    ///
    /// Refuses new connections, unregisters every live one, waits for all
    /// connection tasks to finish, then stops the event loop. Later calls
    /// return once the first has completed.
    pub async fn close(&self) {
        let mut event_loop = self.inner.event_loop.lock().await;
        let Some(handle) = event_loop.take() else {
            return;
        };
        {
            let _gate = self.inner.admission.write().await;
            self.inner.closed.store(true, Ordering::Release);
        }

        let clients = self.inner.registry.read().await.all();
        info!(connections = clients.len(), "hub closing");
        for client in &clients {
            self.unregister(client).await;
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        let _ = self.inner.shutdown_tx.send(());
        if let Err(e) = handle.await {
            error!(error = %e, "hub event loop failed");
        }
        info!("hub closed");
    }

    pub(crate) async fn submit_login(&self, login: LoginMessage) {
        if self.inner.events.login.send(login).await.is_err() {
            debug!("login dropped, hub stopped");
        }
    }

    pub(crate) async fn dispatch_command(&self, client: &Arc<Client>, command: Command) -> HubResult<()> {
        match &self.inner.handler {
            Some(handler) => handler.handle(self, client, command).await,
            None => Err(HubError::InvalidMessage(format!(
                "unknown action: {}",
                command.action
            ))),
        }
    }

    async fn run(self, mut queues: EventQueues, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                Some(client) = queues.register.recv() => {
                    guarded("register", self.on_register(client)).await;
                }
                Some(client) = queues.unregister.recv() => {
                    guarded("unregister", self.on_unregister(client)).await;
                }
                Some(login) = queues.login.recv() => {
                    guarded("login", self.on_login(login)).await;
                }
                else => break,
            }
        }

        // Anything still queued can only be closed.
        queues.register.close();
        while let Ok(client) = queues.register.try_recv() {
            client.close();
        }
        queues.unregister.close();
        while let Ok(client) = queues.unregister.try_recv() {
            self.on_unregister(client).await;
        }
        queues.login.close();
        let leftover = self.inner.registry.write().await.drain();
        for client in leftover {
            self.inner.metrics.client_unregistered();
            client.close();
        }
        debug!("hub event loop stopped");
    }

    async fn on_register(&self, client: Arc<Client>) {
        if self.is_closed() || client.is_closing() {
            client.close();
            return;
        }

        let max = self.inner.config.max_connections_per_key;
        let count = {
            let mut registry = self.inner.registry.write().await;
            let count = registry.insert(client.clone());
            self.inner.metrics.client_registered();
            if count > max {
                registry.remove(client.key(), client.id());
                self.inner.metrics.client_unregistered();
            }
            count
        };

        if count > max {
            warn!(parent: client.span(), count, max, "connection limit reached");
            let err = HubError::MaxConnections(max);
            let _ = client.send_error(err.code(), err.peer_message()).await;
            client.close();
            return;
        }

        client.mark_registered();
        debug!(parent: client.span(), count, "client registered");
    }

    async fn on_unregister(&self, client: Arc<Client>) {
        let removed = self
            .inner
            .registry
            .write()
            .await
            .remove(client.key(), client.id());
        if removed.is_some() {
            self.inner.metrics.client_unregistered();
            debug!(parent: client.span(), "client unregistered");
        }
        client.close();
    }

    async fn on_login(&self, login: LoginMessage) {
        let Some(client) = self.find_client(&login.key, login.id).await else {
            debug!(key = %login.key, id = %login.id, "login for unknown connection");
            return;
        };

        let ctx = client.context().await;
        match self.inner.authenticator.login(ctx, &login).await {
            Ok(ctx) => {
                info!(parent: client.span(), actions = ?login.actions, "client logged in");
                client.install_login(login.actions, ctx).await;
                let _ = client.send(login_ack_frame(client.id())).await;
            }
            Err(e) => {
                warn!(parent: client.span(), error = %e, "login rejected");
                let _ = client.send_error(ErrorCode::Auth, e.peer_message()).await;
            }
        }
    }
}

/// Run one event handler, logging instead of propagating a panic.
async fn guarded<F: Future<Output = ()>>(event: &'static str, fut: F) {
    if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
        error!(event, panic = %panic_message(&*panic), "hub event handler panicked");
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string())
}
