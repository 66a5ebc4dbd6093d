//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`: missing
//! fields in the settings file keep their compiled default.

mod broker;
mod server;

pub use broker::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000, "endpoint": "/chatroom" },
///   "broker": { "processingDelayMs": 0 },
///   "logging": { "level": "debug", "json": true }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Network listener and connection limits.
    pub server: ServerSettings,
    /// Destination namespaces and message processing.
    pub broker: BrokerSettings,
    /// SockJS fallback transport.
    pub sockjs: SockJsSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject combinations the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.server;
        if s.host.trim().is_empty() {
            return Err(SettingsError::InvalidValue("server.host must not be empty".into()));
        }
        if !s.endpoint.starts_with('/') || s.endpoint.len() < 2 || s.endpoint.ends_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "server.endpoint must look like '/path', got '{}'",
                s.endpoint
            )));
        }
        if s.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be at least 1".into(),
            ));
        }
        if s.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be at least 1".into(),
            ));
        }
        if s.heartbeat_interval_ms == 0 || s.heartbeat_timeout_ms < s.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatTimeoutMs must be >= heartbeatIntervalMs > 0".into(),
            ));
        }

        let b = &self.broker;
        if b.processing_delay_ms > MAX_PROCESSING_DELAY_MS {
            return Err(SettingsError::InvalidValue(format!(
                "broker.processingDelayMs must be at most {MAX_PROCESSING_DELAY_MS}"
            )));
        }
        if b.application_prefixes.is_empty() || b.broadcast_prefixes.is_empty() {
            return Err(SettingsError::InvalidValue(
                "broker prefixes must not be empty".into(),
            ));
        }
        for prefix in b.application_prefixes.iter().chain(&b.broadcast_prefixes) {
            if !prefix.starts_with('/') || prefix.trim_end_matches('/').is_empty() {
                return Err(SettingsError::InvalidValue(format!(
                    "broker prefix '{prefix}' must start with '/' and name a path"
                )));
            }
        }
        if let Some(shared) = b
            .application_prefixes
            .iter()
            .find(|p| b.broadcast_prefixes.contains(p))
        {
            return Err(SettingsError::InvalidValue(format!(
                "prefix '{shared}' is both an application and a broadcast prefix"
            )));
        }

        if self.sockjs.enabled && self.sockjs.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "sockjs.heartbeatIntervalMs must be positive".into(),
            ));
        }
        if self.sockjs.enabled && self.sockjs.disconnect_delay_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "sockjs.disconnectDelayMs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
