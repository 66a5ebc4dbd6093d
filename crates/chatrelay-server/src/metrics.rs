//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Call once at startup,
/// before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Metric name constants shared across modules.

/// Connections accepted (counter, labels: transport).
pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
/// Connections rejected at capacity (counter).
pub const CONNECTIONS_REJECTED_TOTAL: &str = "relay_connections_rejected_total";
/// Live connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
/// Connection lifetime (histogram, seconds).
pub const CONNECTION_DURATION_SECONDS: &str = "relay_connection_duration_seconds";
/// Inbound STOMP frames (counter, labels: command).
pub const FRAMES_RECEIVED_TOTAL: &str = "relay_frames_received_total";
/// Session errors (counter, labels: kind).
pub const SESSION_ERRORS_TOTAL: &str = "relay_session_errors_total";
/// Publish calls (counter).
pub const MESSAGES_PUBLISHED_TOTAL: &str = "relay_messages_published_total";
/// Per-subscriber delivery failures (counter).
pub const DELIVERIES_FAILED_TOTAL: &str = "relay_deliveries_failed_total";
/// Subscribers reached per publish (histogram).
pub const PUBLISH_FANOUT: &str = "relay_publish_fanout";
/// Handler invocations (counter, labels: route).
pub const HANDLER_INVOCATIONS_TOTAL: &str = "relay_handler_invocations_total";
/// Handler run time (histogram, seconds, labels: route).
pub const HANDLER_DURATION_SECONDS: &str = "relay_handler_duration_seconds";
