//! Listener, connection limit and transport settings.

use serde::{Deserialize, Serialize};

/// Network and connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Path clients connect to (WebSocket upgrade and SockJS root).
    pub endpoint: String,
    /// Maximum number of live connections.
    pub max_connections: usize,
    /// Maximum size of one inbound transport message in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per connection before deliveries are dropped.
    pub send_queue_capacity: usize,
    /// WebSocket ping interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Close a WebSocket whose last pong is older than this.
    pub heartbeat_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            endpoint: "/chatroom".to_string(),
            max_connections: 1024,
            max_message_size: 64 * 1024,
            send_queue_capacity: 256,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
        }
    }
}

/// SockJS fallback transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SockJsSettings {
    /// Serve the SockJS routes under the endpoint.
    pub enabled: bool,
    /// Interval between `h` frames; also bounds how long an XHR poll waits.
    pub heartbeat_interval_ms: u64,
    /// Close a polling session that has not been polled for this long.
    pub disconnect_delay_ms: u64,
}

impl Default for SockJsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_interval_ms: 25_000,
            disconnect_delay_ms: 5_000,
        }
    }
}
