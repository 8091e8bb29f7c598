//! wshub-server: WebSocket connection hub.
//!
//! Upgrades WebSocket connections on one path, authenticates them against
//! the configured token table, and serves the pub/sub demo commands.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use wshub_server::{
    start_listener, ConfigOverrides, Hub, PubSub, ServerConfig, StaticTokenAuthenticator,
    UpgradeOptions,
};

/// wshub-server — WebSocket connection hub
#[derive(Parser, Debug)]
#[command(name = "wshub-server", version, about = "WebSocket connection hub")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.wshub/config.toml")]
    config: String,

    /// Upgrade path
    #[arg(long)]
    path: Option<String>,

    /// Where the client key comes from (query:<name> or header:<name>)
    #[arg(long)]
    key_source: Option<String>,

    /// Maximum live connections per key
    #[arg(long)]
    max_connections_per_key: Option<usize>,

    /// Login deadline in seconds
    #[arg(long)]
    auth_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// How often hub counts are logged.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let config = ServerConfig::load(
        Some(&config_path),
        ConfigOverrides {
            port: cli.port,
            path: cli.path,
            key_source: cli.key_source,
            max_connections_per_key: cli.max_connections_per_key,
            auth_timeout: cli.auth_timeout,
        },
    )
    .context("failed to load config")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        path = %config.path,
        "starting wshub-server"
    );

    let authenticator = StaticTokenAuthenticator::new(config.tokens.clone());
    if authenticator.is_empty() {
        warn!("no tokens configured — every login will be rejected");
    } else {
        info!(count = authenticator.len(), "loaded login tokens");
    }

    let hub = Hub::builder(authenticator)
        .config(config.hub.clone())
        .handler(PubSub)
        .start()
        .context("failed to start hub")?;

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let options = UpgradeOptions::new(
        config.path.clone(),
        config.key_source.clone().into_key_fn(),
        config.hub.max_message_size,
    );
    let (_addr, listener) = start_listener(bind_addr, hub.clone(), options)
        .await
        .context("failed to start listener")?;

    let stats_hub = hub.clone();
    let stats = tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let s = stats_hub.stats().await;
            info!(
                keys = s.keys,
                connections = s.connections,
                authenticated = s.authenticated,
                "hub stats"
            );
        }
    });

    tokio::select! {
        result = listener => {
            if let Err(e) = result {
                error!(error = %e, "listener stopped");
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    stats.abort();
    if tokio::time::timeout(config.close_timeout, hub.close()).await.is_err() {
        warn!(timeout = ?config.close_timeout, "hub close timed out");
    }

    info!("wshub-server stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
