//! Server configuration.

use std::time::Duration;

use chatrelay_core::DestinationPolicy;
use chatrelay_settings::RelaySettings;
use serde::{Deserialize, Serialize};

/// Runtime configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Path clients connect to.
    pub endpoint: String,
    /// Maximum concurrent connections across all transports.
    pub max_connections: usize,
    /// Max inbound WebSocket message size in bytes; also bounds one STOMP frame.
    pub max_message_size: usize,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Close a WebSocket whose last pong is older than this.
    pub heartbeat_timeout_ms: u64,
    /// Prefixes routed to application handlers.
    pub application_prefixes: Vec<String>,
    /// Prefixes naming subscribable topics.
    pub broadcast_prefixes: Vec<String>,
    /// Wait before an application handler runs.
    pub processing_delay_ms: u64,
    /// Serve the SockJS fallback routes.
    pub sockjs_enabled: bool,
    /// SockJS `h` frame interval and XHR poll timeout.
    pub sockjs_heartbeat_interval_ms: u64,
    /// Idle time after which an unpolled SockJS session is closed.
    pub sockjs_disconnect_delay_ms: u64,
}

impl ServerConfig {
    /// Destination namespaces as a policy.
    pub fn destination_policy(&self) -> DestinationPolicy {
        DestinationPolicy::new(
            self.application_prefixes.iter().cloned(),
            self.broadcast_prefixes.iter().cloned(),
        )
    }

    /// Processing delay as a [`Duration`].
    pub fn processing_delay(&self) -> Duration {
        Duration::from_millis(self.processing_delay_ms)
    }

    /// WebSocket ping interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// WebSocket pong timeout.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// SockJS heartbeat interval.
    pub fn sockjs_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.sockjs_heartbeat_interval_ms)
    }

    /// SockJS disconnect delay.
    pub fn sockjs_disconnect_delay(&self) -> Duration {
        Duration::from_millis(self.sockjs_disconnect_delay_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            endpoint: "/chatroom".into(),
            max_connections: 1024,
            max_message_size: 64 * 1024,
            send_queue_capacity: 256,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            application_prefixes: vec!["/app".into()],
            broadcast_prefixes: vec!["/topic".into()],
            processing_delay_ms: 100,
            sockjs_enabled: true,
            sockjs_heartbeat_interval_ms: 25_000,
            sockjs_disconnect_delay_ms: 5_000,
        }
    }
}

impl From<&RelaySettings> for ServerConfig {
    fn from(settings: &RelaySettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            endpoint: server.endpoint.clone(),
            max_connections: server.max_connections,
            max_message_size: server.max_message_size,
            send_queue_capacity: server.send_queue_capacity,
            heartbeat_interval_ms: server.heartbeat_interval_ms,
            heartbeat_timeout_ms: server.heartbeat_timeout_ms,
            application_prefixes: settings.broker.application_prefixes.clone(),
            broadcast_prefixes: settings.broker.broadcast_prefixes.clone(),
            processing_delay_ms: settings.broker.processing_delay_ms,
            sockjs_enabled: settings.sockjs.enabled,
            sockjs_heartbeat_interval_ms: settings.sockjs.heartbeat_interval_ms,
            sockjs_disconnect_delay_ms: settings.sockjs.disconnect_delay_ms,
        }
    }
}
