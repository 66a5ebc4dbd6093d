//! Destination namespace and message processing settings.

use serde::{Deserialize, Serialize};

/// Upper bound for `processingDelayMs`.
pub const MAX_PROCESSING_DELAY_MS: u64 = 60_000;

/// Broker settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// Prefixes routed to application handlers.
    pub application_prefixes: Vec<String>,
    /// Prefixes naming subscribable topics.
    pub broadcast_prefixes: Vec<String>,
    /// Wait applied before an application handler runs. `0` disables it.
    pub processing_delay_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            application_prefixes: vec!["/app".to_string()],
            broadcast_prefixes: vec!["/topic".to_string()],
            processing_delay_ms: 100,
        }
    }
}
