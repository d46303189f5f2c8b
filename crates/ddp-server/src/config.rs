//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Log output style.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Configuration for the DDP server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Interval between server pings, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Close a connection once this many pings are unanswered at a tick.
    pub max_unanswered_pings: usize,
    /// Budget for a pending method result, in milliseconds.
    pub method_timeout_ms: u64,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Outbound frames buffered per connection before back-pressure.
    pub send_queue_capacity: usize,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Log output style.
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            heartbeat_interval_ms: 10_000,
            max_unanswered_pings: 5,
            method_timeout_ms: 60_000,
            max_connections: 1024,
            send_queue_capacity: 1024,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            log_level: "info".into(),
            log_format: LogFormat::Compact,
        }
    }
}

impl ServerConfig {
    /// Heartbeat tick period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Pending method budget.
    pub fn method_timeout(&self) -> Duration {
        Duration::from_millis(self.method_timeout_ms)
    }

    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
