//! Relay error taxonomy.

use crate::ids::ConnectionId;

/// Errors produced by the registry, the router and the STOMP session.
///
/// Variants are split by their effect on the connection that triggered them:
/// see [`RelayError::closes_connection`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// The registry already holds its maximum number of live connections.
    #[error("connection limit reached ({limit})")]
    CapacityExceeded {
        /// Configured connection limit.
        limit: usize,
    },
    /// No live connection with this id.
    #[error("connection not found: {0}")]
    NotFound(ConnectionId),
    /// Topic name outside the broadcast namespace or otherwise malformed.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),
    /// Destination matches neither a route nor the broadcast namespace.
    #[error("no handler for destination: {0}")]
    UnknownDestination(String),
    /// Frame not allowed in the connection's current state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// Inbound text could not be parsed as STOMP.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// A single subscriber could not be handed a message.
    #[error("delivery to {connection} failed: {reason}")]
    DeliveryFailure {
        /// Subscriber that missed the message.
        connection: ConnectionId,
        /// Why the enqueue failed.
        reason: String,
    },
    /// Underlying transport dropped or failed.
    #[error("transport error: {0}")]
    TransportError(String),
    /// Work was abandoned because the connection or the server shut down.
    #[error("cancelled")]
    Cancelled,
}

impl RelayError {
    /// Whether the session must send an `ERROR` frame and close after this
    /// error. Operation-level rejections leave the connection open.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. }
                | Self::ProtocolViolation(_)
                | Self::MalformedFrame(_)
                | Self::TransportError(_)
                | Self::Cancelled
        )
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::NotFound(_) => "not_found",
            Self::InvalidTopic(_) => "invalid_topic",
            Self::UnknownDestination(_) => "unknown_destination",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::MalformedFrame(_) => "malformed_frame",
            Self::DeliveryFailure { .. } => "delivery_failure",
            Self::TransportError(_) => "transport_error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Result alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
