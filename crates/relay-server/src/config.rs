//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (RELAY_HOST, RELAY_PORT, RELAY_CONFIG)
//! - TOML configuration file

use anyhow::{ensure, Context, Result};
use relay_core::{ClientConfig, HubConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Authorization configuration.
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of registered clients.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Outbound queue capacity per client, in frames.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Capacity of each hub event channel.
    #[serde(default = "default_hub_capacity")]
    pub hub_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Read deadline in milliseconds, refreshed by each pong.
    #[serde(default = "default_pong_wait")]
    pub pong_wait_ms: u64,

    /// Write deadline in milliseconds.
    #[serde(default = "default_write_wait")]
    pub write_wait_ms: u64,

    /// Ping interval in milliseconds. Defaults to 9/10 of `pong_wait_ms`.
    #[serde(default)]
    pub ping_period_ms: Option<u64>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Authorization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Grant a generated identity to unknown or missing tokens.
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,

    /// Label given to anonymous identities.
    #[serde(default = "default_anonymous_label")]
    pub anonymous_label: String,

    /// Known tokens.
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

/// A token and the identity it resolves to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    /// Credential presented by the client.
    pub token: String,
    /// Identity id.
    pub id: String,
    /// Display label.
    pub label: String,
}

// Default value functions
fn default_host() -> String {
    std::env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("RELAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_frame_size() -> usize {
    512
}

fn default_queue_capacity() -> usize {
    256
}

fn default_hub_capacity() -> usize {
    64
}

fn default_pong_wait() -> u64 {
    60_000 // 60 seconds
}

fn default_write_wait() -> u64 {
    10_000 // 10 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_anonymous_label() -> String {
    "guest".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
            queue_capacity: default_queue_capacity(),
            hub_capacity: default_hub_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            pong_wait_ms: default_pong_wait(),
            write_wait_ms: default_write_wait(),
            ping_period_ms: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allow_anonymous: true,
            anonymous_label: default_anonymous_label(),
            tokens: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// `RELAY_CONFIG` names an explicit file; otherwise the default paths are
    /// tried in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("RELAY_CONFIG") {
            return Self::from_file(shellexpand::tilde(&path).as_ref());
        }

        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Check settings that would otherwise fail later at startup.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        let path = &self.transport.websocket_path;
        ensure!(
            path.starts_with('/'),
            "transport.websocket_path must start with '/', got {:?}",
            path
        );
        ensure!(
            path != "/health",
            "transport.websocket_path must not shadow /health"
        );
        ensure!(
            self.limits.max_frame_size > 0,
            "limits.max_frame_size must be positive"
        );
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Per-client settings for the hub's clients.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        let pong_wait = Duration::from_millis(self.heartbeat.pong_wait_ms);
        let mut client = ClientConfig {
            max_frame_size: self.limits.max_frame_size,
            queue_capacity: self.limits.queue_capacity,
            write_wait: Duration::from_millis(self.heartbeat.write_wait_ms),
            ..ClientConfig::default()
        }
        .with_pong_wait(pong_wait);

        if let Some(ms) = self.heartbeat.ping_period_ms {
            client.ping_period = Duration::from_millis(ms);
        }
        client
    }

    /// Hub settings.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            channel_capacity: self.limits.hub_capacity,
        }
    }
}
