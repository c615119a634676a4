//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`COURIER_CONFIG`, or the first `courier.toml` found)
//! - Environment variables (`COURIER__PORT`, `COURIER__LIMITS__MAX_CONNECTIONS`, ...)

use anyhow::{Context, Result};
use courier_core::{HeartbeatConfig, HubConfig, SessionConfig, Topics};
use courier_protocol::UserId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "COURIER_CONFIG";

/// Prefix for environment overrides.
const ENV_PREFIX: &str = "COURIER";

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

    /// Liveness configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,

    /// Cross-instance bus.
    #[serde(default)]
    pub bus: BusConfig,

    /// Static group membership for group fanout.
    #[serde(default)]
    pub groups: Vec<GroupEntry>,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Connection authentication.
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
    /// Maximum number of concurrently online users.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound queue capacity per session.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

/// Liveness timing, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    /// Interval between transport pings.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Read deadline, extended on every acknowledgment.
    #[serde(default = "default_pong_wait")]
    pub pong_wait_ms: u64,

    /// Deadline for a single write.
    #[serde(default = "default_write_wait")]
    pub write_wait_ms: u64,

    /// Interval between heartbeat sweeps.
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,

    /// Sessions idle for longer than this are evicted.
    #[serde(default = "default_dead_threshold")]
    pub dead_threshold_ms: u64,
}

/// Which bus implementation carries fanout traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    /// Process-local, no fanout to other instances.
    #[default]
    Memory,
    /// Redis pub/sub.
    Redis,
}

/// Bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub backend: BusBackend,

    /// Server URL for the Redis backend.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Topic names.
    #[serde(default)]
    pub topics: Topics,
}

/// Members of one chat group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEntry {
    pub id: i64,
    #[serde(default)]
    pub members: Vec<UserId>,
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

/// Static bearer tokens accepted by the connection gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

/// One accepted token and the user it resolves to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: UserId,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
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

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_ping_interval() -> u64 {
    30_000
}

fn default_pong_wait() -> u64 {
    60_000
}

fn default_write_wait() -> u64 {
    10_000
}

fn default_check_interval() -> u64 {
    30_000
}

fn default_dead_threshold() -> u64 {
    90_000
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatSettings::default(),
            bus: BusConfig::default(),
            groups: Vec::new(),
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
            max_message_size: default_max_message_size(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval(),
            pong_wait_ms: default_pong_wait(),
            write_wait_ms: default_write_wait(),
            check_interval_ms: default_check_interval(),
            dead_threshold_ms: default_dead_threshold(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::default(),
            redis_url: default_redis_url(),
            topics: Topics::default(),
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

impl AuthConfig {
    /// Token to user lookup table.
    #[must_use]
    pub fn token_map(&self) -> HashMap<String, UserId> {
        self.tokens
            .iter()
            .map(|entry| (entry.token.clone(), entry.user_id))
            .collect()
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let path = match std::env::var(CONFIG_PATH_ENV) {
            Ok(explicit) => Some(PathBuf::from(shellexpand::tilde(&explicit).as_ref())),
            Err(_) => find_config_file(),
        };

        Self::layered(path.as_deref(), None)
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

        Ok(config)
    }

    /// Merge an optional TOML file with `COURIER__*` environment overrides.
    ///
    /// `env` replaces the process environment when given.
    fn layered(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        let config = ::config::Config::builder()
            .add_source(
                ::config::Config::try_from(&base).context("Failed to convert base configuration")?,
            )
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Core configuration derived from these settings.
    #[must_use]
    pub fn to_hub_config(&self) -> HubConfig {
        let heartbeat = &self.heartbeat;
        HubConfig {
            session: SessionConfig {
                outbound_capacity: self.limits.outbound_queue_capacity,
                ping_interval: Duration::from_millis(heartbeat.ping_interval_ms),
                pong_wait: Duration::from_millis(heartbeat.pong_wait_ms),
                write_wait: Duration::from_millis(heartbeat.write_wait_ms),
                max_message_size: self.limits.max_message_size,
            },
            heartbeat: HeartbeatConfig {
                interval: Duration::from_millis(heartbeat.check_interval_ms),
                dead_threshold: Duration::from_millis(heartbeat.dead_threshold_ms),
            },
            topics: self.bus.topics.clone(),
        }
    }
}

fn find_config_file() -> Option<PathBuf> {
    let config_paths = [
        "courier.toml",
        "/etc/courier/courier.toml",
        "~/.config/courier/courier.toml",
    ];

    config_paths
        .iter()
        .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
        .find(|path| path.exists())
}
