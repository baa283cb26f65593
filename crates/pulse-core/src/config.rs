//! Configuration parsing for the telemetry system.
//!
//! Both sides read one JSON config file. The top-level structure contains
//! logging metadata, an optional `broker` section (server side), and an
//! optional `client` section (consumer, health monitor, aggregator). Every
//! tunable has a default, so `{}` is a valid section.
//!
//! # Example config
//!
//! ```json
//! {
//!   "logging": { "module_name": "pulse", "log_path": "/tmp/log" },
//!   "broker": { "bind_addr": "0.0.0.0:8081", "replay_buffer_size": 100 },
//!   "client": {
//!     "ws_url": "ws://127.0.0.1:8081/ws",
//!     "api_base_url": "http://127.0.0.1:8080",
//!     "max_reconnect_attempts": 10,
//!     "timeframes": ["1m", "1h"]
//!   }
//! }
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::PulseError;
use crate::types::Channel;

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Module metadata (name, log path).
    #[serde(default)]
    pub logging: Option<LoggingMeta>,

    /// Channel broker settings (server side).
    #[serde(default)]
    pub broker: Option<BrokerConfig>,

    /// Consumer / monitor / aggregator settings (client side).
    #[serde(default)]
    pub client: Option<ClientConfig>,
}

/// Logging metadata block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingMeta {
    pub module_name: Option<String>,
    pub log_path: Option<String>,
    /// `"text"` (default) or `"json"`.
    pub format: Option<String>,
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// Channel broker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// TCP address the WebSocket server listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Channels clients may subscribe to.
    #[serde(default = "default_channels")]
    pub channels: Vec<Channel>,

    /// Events retained per channel for late subscribers.
    #[serde(default = "default_replay_buffer_size")]
    pub replay_buffer_size: usize,

    /// Heartbeat period in milliseconds.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,

    /// Outbound queue depth per connection; a full queue drops for that
    /// connection only.
    #[serde(default = "default_subscriber_queue_size")]
    pub subscriber_queue_size: usize,

    /// Bearer token required on the WebSocket handshake, if set.
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl BrokerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn validate(&self) -> Result<(), PulseError> {
        if self.replay_buffer_size == 0 {
            return Err(PulseError::Config("broker.replay_buffer_size must be > 0".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(PulseError::Config("broker.heartbeat_interval_ms must be > 0".into()));
        }
        // Subscribing to every channel back to back queues each full replay
        // plus its ack before the writer drains anything.
        let burst = self.channels.len().max(1) * (self.replay_buffer_size + 1);
        if self.subscriber_queue_size <= burst {
            return Err(PulseError::Config(format!(
                "broker.subscriber_queue_size must exceed {burst} \
                 (channels x (replay_buffer_size + 1))"
            )));
        }
        Ok(())
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            channels: default_channels(),
            replay_buffer_size: default_replay_buffer_size(),
            heartbeat_interval_ms: default_heartbeat_ms(),
            subscriber_queue_size: default_subscriber_queue_size(),
            auth_token: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Client-side configuration: consumer, health monitor, and aggregator.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    // -- Push channel --
    /// Broker WebSocket URL.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Bearer token sent on the WebSocket handshake.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Channels to subscribe after every (re)connect.
    #[serde(default = "default_channels")]
    pub channels: Vec<Channel>,

    /// Expected broker heartbeat period; silence for twice this is a timeout.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,

    /// Reconnect attempts before giving up until the next `start()`.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Capacity of the sample broadcast channel.
    #[serde(default = "default_sample_capacity")]
    pub sample_capacity: usize,

    // -- REST --
    /// Core-service REST base URL (health probe + fallback endpoints).
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Default timeout for fallback pull requests.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    // -- Health monitor --
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    // -- Aggregator --
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Bound on every observed collection.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Candlestick timeframes tracked from startup.
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<String>,
}

impl ClientConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence after which the push link is considered dead (2× heartbeat).
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval() * 2
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), PulseError> {
        let non_zero = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("initial_backoff_ms", self.initial_backoff_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("health_interval_ms", self.health_interval_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("reconcile_interval_ms", self.reconcile_interval_ms),
            ("poll_interval_ms", self.poll_interval_ms),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(PulseError::Config(format!("client.{name} must be > 0")));
            }
        }
        if self.history_limit == 0 || self.sample_capacity == 0 {
            return Err(PulseError::Config(
                "client.history_limit and client.sample_capacity must be > 0".into(),
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(PulseError::Config(
                "client.max_backoff_ms must be >= initial_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            auth_token: None,
            channels: default_channels(),
            heartbeat_interval_ms: default_heartbeat_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            sample_capacity: default_sample_capacity(),
            api_base_url: default_api_base_url(),
            request_timeout_ms: default_request_timeout_ms(),
            health_interval_ms: default_health_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            history_limit: default_history_limit(),
            timeframes: default_timeframes(),
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_bind_addr() -> String {
    "127.0.0.1:8081".into()
}

fn default_channels() -> Vec<Channel> {
    Channel::ALL.to_vec()
}

fn default_replay_buffer_size() -> usize {
    100
}

fn default_heartbeat_ms() -> u64 {
    15_000
}

fn default_subscriber_queue_size() -> usize {
    1024
}

fn default_ws_url() -> String {
    "ws://127.0.0.1:8081/ws".into()
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_sample_capacity() -> usize {
    1024
}

fn default_api_base_url() -> String {
    "http://127.0.0.1:8080".into()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_health_interval_ms() -> u64 {
    5_000
}

fn default_probe_timeout_ms() -> u64 {
    3_000
}

fn default_reconcile_interval_ms() -> u64 {
    2_000
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_history_limit() -> usize {
    100
}

fn default_timeframes() -> Vec<String> {
    vec!["1h".into()]
}

/// Load, parse, and validate a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&content)?;
    if let Some(broker) = &config.broker {
        broker.validate()?;
    }
    if let Some(client) = &config.client {
        client.validate()?;
    }
    Ok(config)
}
