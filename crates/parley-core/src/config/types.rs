//! Configuration types for parley
//!
//! Defines the structure of `.parley.toml`.

use super::profiles::ProfilesConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParleyConfig {
    /// State directory (agents, replies, sockets, logs). Defaults to `~/.parley`
    #[serde(default)]
    pub home: Option<PathBuf>,

    /// Wrapped-program profiles
    #[serde(default)]
    pub profiles: ProfilesConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub replies: RepliesConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ParleyConfig {
    /// Resolved state directory
    pub fn home_dir(&self) -> PathBuf {
        self.home.clone().unwrap_or_else(default_home)
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.home_dir().join("agents")
    }

    pub fn replies_dir(&self) -> PathBuf {
        self.home_dir().join("replies")
    }

    pub fn sockets_dir(&self) -> PathBuf {
        self.home_dir().join("sockets")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir().join("logs")
    }
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".parley")
}

/// Outbound routing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Upper bound on a roundtrip wait
    #[serde(default = "default_roundtrip_timeout")]
    pub roundtrip_timeout_secs: u64,

    /// Interval between remote task polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Connect/write timeout for a single transport call
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// How long to wait for the receiver's answer once a request is sent
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
}

fn default_roundtrip_timeout() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    500
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_response_timeout() -> u64 {
    30_000
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            roundtrip_timeout_secs: default_roundtrip_timeout(),
            poll_interval_ms: default_poll_interval(),
            connect_timeout_ms: default_connect_timeout(),
            response_timeout_ms: default_response_timeout(),
        }
    }
}

impl RouterConfig {
    pub fn roundtrip_timeout(&self) -> Duration {
        Duration::from_secs(self.roundtrip_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Reply tracker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepliesConfig {
    /// How long an unanswered sender stays pending
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
}

fn default_retention() -> u64 {
    3600
}

impl Default for RepliesConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention(),
        }
    }
}

impl RepliesConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Network listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// 0 picks an ephemeral port
    #[serde(default)]
    pub port: u16,

    /// Also listen on a Unix socket under `<home>/sockets`
    #[serde(default = "default_true")]
    pub local_socket: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            local_socket: true,
        }
    }
}

/// Output buffering settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Ring buffer capacity per session
    #[serde(default = "default_buffer_bytes")]
    pub buffer_bytes: usize,
}

fn default_buffer_bytes() -> usize {
    256 * 1024
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            buffer_bytes: default_buffer_bytes(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Fallback filter when `RUST_LOG` is unset
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}
