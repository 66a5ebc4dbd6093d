//! The relay endpoint: registry, router and routes wired together.

pub mod routes;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use chatrelay_core::{DestinationPolicy, Message, Result};
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broker::{ConnectionRegistry, PublishReport, TopicRouter};
use crate::config::ServerConfig;
use crate::metrics::CONNECTIONS_TOTAL;

pub use routes::{EchoHandler, MessageHandler, RouteTable};
pub use session::{Flow, SessionState, StompSession};

/// Shared relay state. One per server; every transport opens sessions here.
pub struct Relay {
    registry: Arc<ConnectionRegistry>,
    routes: RouteTable,
    policy: DestinationPolicy,
    processing_delay: Duration,
    send_queue_capacity: usize,
    max_frame_size: usize,
    shutdown: CancellationToken,
}

impl Relay {
    /// Build a relay. Connection tokens are children of `shutdown`, so
    /// cancelling it stops every session.
    ///
    /// Fails if a route broadcasts outside the configured namespace.
    pub fn new(config: &ServerConfig, routes: RouteTable, shutdown: CancellationToken) -> Result<Self> {
        let policy = config.destination_policy();
        routes.validate(&policy)?;
        let router = Arc::new(TopicRouter::new(policy.clone()));
        Ok(Self {
            registry: Arc::new(ConnectionRegistry::new(router, config.max_connections)),
            routes,
            policy,
            processing_delay: config.processing_delay(),
            send_queue_capacity: config.send_queue_capacity,
            max_frame_size: config.max_message_size,
            shutdown,
        })
    }

    /// Register a new connection and return its session plus the receiving
    /// end of its outbound queue. `transport` labels metrics only.
    pub fn open(
        self: &Arc<Self>,
        transport: &'static str,
    ) -> Result<(StompSession, mpsc::Receiver<String>)> {
        let (tx, rx) = mpsc::channel(self.send_queue_capacity);
        let connection = self.registry.register(tx, self.shutdown.child_token())?;
        counter!(CONNECTIONS_TOTAL, "transport" => transport).increment(1);
        info!(conn_id = %connection.id, transport, "connection opened");
        Ok((StompSession::new(Arc::clone(self), connection), rx))
    }

    /// Publish `message` to `topic`.
    pub fn publish(&self, topic: &str, message: &Message) -> Result<PublishReport> {
        self.registry.publish(topic, message)
    }

    /// Force-close every live connection.
    pub fn close_all(&self) -> usize {
        self.registry.close_all()
    }

    /// Connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Topic router.
    pub fn router(&self) -> &Arc<TopicRouter> {
        self.registry.router()
    }

    /// Application routes.
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Destination namespaces.
    pub fn policy(&self) -> &DestinationPolicy {
        &self.policy
    }

    /// Wait before an application handler runs.
    pub fn processing_delay(&self) -> Duration {
        self.processing_delay
    }

    /// Largest inbound STOMP frame accepted.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Server-wide shutdown token.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("connections", &self.registry.count())
            .field("routes", &self.routes.paths())
            .field("processing_delay", &self.processing_delay)
            .finish_non_exhaustive()
    }
}
