//! Configuration management for the call core

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Relay server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Signaling client configuration
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// Call behaviour
    #[serde(default)]
    pub call: CallConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Relay WebSocket URL
    #[serde(default = "default_signaling_url")]
    pub url: String,

    /// First reconnect delay in ms
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    /// Reconnect delay cap in ms
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: default_signaling_url(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl SignalingConfig {
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// STUN server used for ICE
    #[serde(default = "default_stun_server")]
    pub stun_server: String,

    /// Seconds before an unanswered call is given up (0 disables)
    #[serde(default = "default_ring_timeout_secs")]
    pub ring_timeout_secs: u64,

    /// Elapsed-time tick period in ms
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            stun_server: default_stun_server(),
            ring_timeout_secs: default_ring_timeout_secs(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl CallConfig {
    pub fn ring_timeout(&self) -> Option<Duration> {
        match self.ring_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            signaling: SignalingConfig::default(),
            call: CallConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.port == 0 {
            return Err("Server port must be non-zero".into());
        }

        if !self.call.stun_server.starts_with("stun:") {
            return Err("Call stun_server must be a stun: URL".into());
        }

        if self.call.tick_interval_ms == 0 {
            return Err("Call tick_interval_ms must be non-zero".into());
        }

        if self.signaling.reconnect_initial_ms == 0 {
            return Err("Signaling reconnect_initial_ms must be non-zero".into());
        }

        if self.signaling.reconnect_initial_ms > self.signaling.reconnect_max_ms {
            return Err("Signaling reconnect_initial_ms cannot exceed reconnect_max_ms".into());
        }

        if !(self.signaling.url.starts_with("ws://") || self.signaling.url.starts_with("wss://")) {
            return Err("Signaling url must be a ws:// or wss:// URL".into());
        }

        Ok(())
    }
}


fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_signaling_url() -> String {
    "ws://127.0.0.1:8080/signaling".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> u16 { 8080 }

fn default_stun_server() -> String {
    DEFAULT_STUN_SERVER.to_string()
}

fn default_ring_timeout_secs() -> u64 { 45 }
fn default_tick_interval_ms() -> u64 { 1000 }
fn default_reconnect_initial_ms() -> u64 { 500 }
fn default_reconnect_max_ms() -> u64 { 30_000 }
