//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use wshub_core::{HubError, HubResult};

use crate::transport::websocket::KeySource;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub hub: HubSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_key_source")]
    pub key_source: String,
    /// Seconds allowed for a graceful hub shutdown.
    #[serde(default = "default_close_timeout")]
    pub close_timeout: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            path: default_path(),
            key_source: default_key_source(),
            close_timeout: default_close_timeout(),
        }
    }
}

/// `[hub]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct HubSection {
    #[serde(default = "default_max_connections_per_key")]
    pub max_connections_per_key: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout: u64,
    #[serde(default = "default_pong_wait")]
    pub pong_wait: u64,
    #[serde(default = "default_write_wait")]
    pub write_wait: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            max_connections_per_key: default_max_connections_per_key(),
            queue_capacity: default_queue_capacity(),
            event_capacity: default_event_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
            auth_timeout: default_auth_timeout(),
            pong_wait: default_pong_wait(),
            write_wait: default_write_wait(),
            max_message_size: default_max_message_size(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    /// Token → grant. `[auth.tokens.<token>]` tables.
    #[serde(default)]
    pub tokens: HashMap<String, TokenGrant>,
}

/// What a single login token is allowed to do.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenGrant {
    /// Restrict the token to one logical key.
    #[serde(default)]
    pub key: Option<String>,
    /// Actions the token may request. `"*"` allows any.
    #[serde(default)]
    pub actions: Vec<String>,
}

fn default_port() -> u16 {
    8080
}
fn default_path() -> String {
    "/ws".to_string()
}
fn default_key_source() -> String {
    "query:key".to_string()
}
fn default_close_timeout() -> u64 {
    3
}
fn default_max_connections_per_key() -> usize {
    10
}
fn default_queue_capacity() -> usize {
    512
}
fn default_event_capacity() -> usize {
    1024
}
fn default_send_timeout_ms() -> u64 {
    500
}
fn default_auth_timeout() -> u64 {
    60
}
fn default_pong_wait() -> u64 {
    60
}
fn default_write_wait() -> u64 {
    10
}
fn default_max_message_size() -> usize {
    512
}

/// Runtime limits of a [`Hub`](crate::hub::Hub) and its connections.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Live connections allowed per logical key.
    pub max_connections_per_key: usize,
    /// Capacity of each connection's outbound queue.
    pub queue_capacity: usize,
    /// Capacity of each hub event channel (register, unregister, login).
    pub event_capacity: usize,
    /// How long `send` may wait on a full queue before the peer is dropped.
    pub send_timeout: Duration,
    /// Time a connection has to complete login.
    pub auth_timeout: Duration,
    /// Read deadline, refreshed on every pong.
    pub pong_wait: Duration,
    /// Deadline for a single socket write.
    pub write_wait: Duration,
    /// Largest inbound message accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubSection::default().into()
    }
}

impl From<HubSection> for HubConfig {
    fn from(s: HubSection) -> Self {
        Self {
            max_connections_per_key: s.max_connections_per_key,
            queue_capacity: s.queue_capacity,
            event_capacity: s.event_capacity,
            send_timeout: Duration::from_millis(s.send_timeout_ms),
            auth_timeout: Duration::from_secs(s.auth_timeout),
            pong_wait: Duration::from_secs(s.pong_wait),
            write_wait: Duration::from_secs(s.write_wait),
            max_message_size: s.max_message_size,
        }
    }
}

impl HubConfig {
    /// Keepalive ping interval: 9/10 of the peer's read deadline.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 9 / 10
    }

    pub fn validate(&self) -> HubResult<()> {
        if self.max_connections_per_key == 0 {
            return Err(HubError::Config("max_connections_per_key must be > 0".into()));
        }
        if self.queue_capacity == 0 || self.event_capacity == 0 {
            return Err(HubError::Config("channel capacities must be > 0".into()));
        }
        if self.pong_wait.is_zero() {
            return Err(HubError::Config("pong_wait must be > 0".into()));
        }
        Ok(())
    }
}

/// Values supplied on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub path: Option<String>,
    pub key_source: Option<String>,
    pub max_connections_per_key: Option<usize>,
    pub auth_timeout: Option<u64>,
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub path: String,
    pub key_source: KeySource,
    pub close_timeout: Duration,
    pub hub: HubConfig,
    pub tokens: HashMap<String, TokenGrant>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> HubResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| HubError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        // Merge CLI overrides
        let mut hub_section = file_config.hub;
        if let Some(max) = overrides.max_connections_per_key {
            hub_section.max_connections_per_key = max;
        }
        if let Some(secs) = overrides.auth_timeout {
            hub_section.auth_timeout = secs;
        }
        let hub: HubConfig = hub_section.into();
        hub.validate()?;

        let key_source = overrides
            .key_source
            .unwrap_or(file_config.server.key_source)
            .parse::<KeySource>()?;

        let path = overrides.path.unwrap_or(file_config.server.path);
        if !path.starts_with('/') {
            return Err(HubError::Config(format!("path must start with '/': {path}")));
        }

        Ok(Self {
            port: overrides.port.unwrap_or(file_config.server.port),
            path,
            key_source,
            close_timeout: Duration::from_secs(file_config.server.close_timeout),
            hub,
            tokens: file_config.auth.tokens,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let cfg = ServerConfig::load(None, ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.path, "/ws");
        assert_eq!(cfg.key_source, KeySource::Query("key".into()));
        assert_eq!(cfg.close_timeout, Duration::from_secs(3));
        assert_eq!(cfg.hub.max_connections_per_key, 10);
        assert_eq!(cfg.hub.send_timeout, Duration::from_millis(500));
        assert_eq!(cfg.hub.ping_period(), Duration::from_secs(54));
        assert!(cfg.tokens.is_empty());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = ServerConfig::load(
            Some(Path::new("/nonexistent/wshub.toml")),
            ConfigOverrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.port, 8080);
    }

    #[test]
    fn file_then_cli_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[server]
port = 9000
key_source = "header:x-client-key"

[hub]
max_connections_per_key = 3
auth_timeout = 5

[auth.tokens.t1]
key = "u1"
actions = ["topic.a"]
"#
        )
        .unwrap();

        let cfg = ServerConfig::load(
            Some(file.path()),
            ConfigOverrides {
                port: Some(9100),
                max_connections_per_key: Some(4),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.key_source, KeySource::Header("x-client-key".into()));
        assert_eq!(cfg.hub.max_connections_per_key, 4);
        assert_eq!(cfg.hub.auth_timeout, Duration::from_secs(5));
        let grant = &cfg.tokens["t1"];
        assert_eq!(grant.key.as_deref(), Some("u1"));
        assert_eq!(grant.actions, vec!["topic.a".to_string()]);
    }

    #[test]
    fn rejects_zero_capacity() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[hub]\nqueue_capacity = 0\n").unwrap();
        let err = ServerConfig::load(Some(file.path()), ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, HubError::Config(_)));
    }
}
