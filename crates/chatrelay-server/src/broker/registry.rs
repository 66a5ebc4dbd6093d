//! Live connection registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chatrelay_core::{ConnectionId, Message, RelayError, Result};
use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::router::{DeliverySink, PublishReport, TopicRouter};
use crate::metrics::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL};
use crate::websocket::connection::ClientConnection;

/// Owns every live connection and keeps the router consistent with it.
///
/// Subscription changes go through the registry and hold the connection's
/// map entry while they touch the router, so an `unregister` racing a
/// `subscribe` is serialized and no stale id survives in a topic.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
    live: AtomicUsize,
    max_connections: usize,
    router: Arc<TopicRouter>,
}

impl ConnectionRegistry {
    /// Create a registry that admits at most `max_connections` connections.
    pub fn new(router: Arc<TopicRouter>, max_connections: usize) -> Self {
        Self {
            connections: DashMap::new(),
            live: AtomicUsize::new(0),
            max_connections,
            router,
        }
    }

    /// Admit a connection whose frames are written to `outbound`.
    pub fn register(
        &self,
        outbound: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<Arc<ClientConnection>> {
        let limit = self.max_connections;
        if self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_err()
        {
            counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
            return Err(RelayError::CapacityExceeded { limit });
        }

        let connection = Arc::new(ClientConnection::new(ConnectionId::new(), outbound, cancel));
        let _ = self
            .connections
            .insert(connection.id.clone(), Arc::clone(&connection));
        #[allow(clippy::cast_precision_loss)]
        gauge!(CONNECTIONS_ACTIVE).set(self.count() as f64);
        debug!(conn_id = %connection.id, "connection registered");
        Ok(connection)
    }

    /// Remove a connection and purge it from every topic.
    ///
    /// Returns `false` if it was already gone.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let Some((_, connection)) = self.connections.remove(id) else {
            return false;
        };
        let _ = self.live.fetch_sub(1, Ordering::AcqRel);
        let purged = self.router.remove_connection(id);
        connection.close();
        #[allow(clippy::cast_precision_loss)]
        gauge!(CONNECTIONS_ACTIVE).set(self.count() as f64);
        debug!(
            conn_id = %id,
            topics = purged,
            dropped = connection.drop_count(),
            "connection unregistered"
        );
        true
    }

    /// Resolve a live connection.
    pub fn lookup(&self, id: &ConnectionId) -> Result<Arc<ClientConnection>> {
        self.connections
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RelayError::NotFound(id.clone()))
    }

    /// Bind `subscription_id` to `topic` on a connection.
    ///
    /// Returns `false` when the same id is already bound to the same topic.
    /// Re-using the id for another topic is a protocol violation.
    pub fn subscribe(&self, id: &ConnectionId, subscription_id: &str, topic: &str) -> Result<bool> {
        let entry = self
            .connections
            .get(id)
            .ok_or_else(|| RelayError::NotFound(id.clone()))?;
        let connection = entry.value();

        if let Some(existing) = connection.subscription_topic(subscription_id) {
            if existing == topic {
                return Ok(false);
            }
            return Err(RelayError::ProtocolViolation(format!(
                "subscription id '{subscription_id}' is already bound to '{existing}'"
            )));
        }

        let _ = self.router.subscribe(id, topic)?;
        let _ = connection.add_subscription(subscription_id, topic);
        Ok(true)
    }

    /// Drop a subscription. The router entry goes only when no other
    /// subscription on the connection still targets the topic.
    ///
    /// Returns `false` if the subscription id is unknown.
    pub fn unsubscribe(&self, id: &ConnectionId, subscription_id: &str) -> Result<bool> {
        let entry = self
            .connections
            .get(id)
            .ok_or_else(|| RelayError::NotFound(id.clone()))?;
        let connection = entry.value();

        let Some(topic) = connection.remove_subscription(subscription_id) else {
            return Ok(false);
        };
        if !connection.has_topic(&topic) {
            let _ = self.router.unsubscribe(id, &topic);
        }
        Ok(true)
    }

    /// Publish through the router with this registry as the delivery sink.
    pub fn publish(&self, topic: &str, message: &Message) -> Result<PublishReport> {
        self.router.publish(topic, message, self)
    }

    /// Force-close and unregister every live connection.
    pub fn close_all(&self) -> usize {
        // Collect first: unregistering while iterating would deadlock on the
        // shard locks.
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| e.key().clone()).collect();
        let closed = ids.iter().filter(|id| self.unregister(id)).count();
        if closed > 0 {
            info!(closed, "closed all connections");
        }
        closed
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Configured connection limit.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// The router this registry keeps in sync.
    pub fn router(&self) -> &Arc<TopicRouter> {
        &self.router
    }
}

impl DeliverySink for ConnectionRegistry {
    fn deliver(&self, connection: &ConnectionId, message: &Message) -> Result<usize> {
        let target = self
            .lookup(connection)
            .map_err(|_| RelayError::DeliveryFailure {
                connection: connection.clone(),
                reason: "connection closed".into(),
            })?;
        target.deliver(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chatrelay_core::{Command, DestinationPolicy, Frame};

    fn make_registry(max: usize) -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(TopicRouter::new(DestinationPolicy::default())), max)
    }

    fn connect(registry: &ConnectionRegistry) -> (Arc<ClientConnection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = registry.register(tx, CancellationToken::new()).unwrap();
        (conn, rx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_subscribe_and_unregister_leave_no_stale_ids() {
        let registry = Arc::new(make_registry(1024));
        let mut receivers = Vec::new();
        let mut handles = Vec::new();

        for _ in 0..200 {
            let (conn, rx) = connect(&registry);
            receivers.push(rx);

            let subscriber = Arc::clone(&registry);
            let id = conn.id.clone();
            handles.push(tokio::spawn(async move {
                for n in 0..8 {
                    let _ = subscriber.subscribe(&id, &format!("sub-{n}"), &format!("/topic/t{}", n % 3));
                    tokio::task::yield_now().await;
                }
            }));

            let remover = Arc::clone(&registry);
            let id = conn.id.clone();
            handles.push(tokio::spawn(async move {
                tokio::task::yield_now().await;
                let _ = remover.unregister(&id);
            }));
        }

        for handle in futures::future::join_all(handles).await {
            handle.unwrap();
        }
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.router().topic_count(), 0);
    }

    #[test]
    fn register_and_lookup() {
        let registry = make_registry(4);
        let (conn, _rx) = connect(&registry);
        assert_eq!(registry.count(), 1);
        let found = registry.lookup(&conn.id).unwrap();
        assert!(Arc::ptr_eq(&found, &conn));
    }

    #[test]
    fn lookup_miss_is_not_found() {
        let registry = make_registry(4);
        let missing = ConnectionId::from_raw("conn_missing");
        assert_matches!(registry.lookup(&missing), Err(RelayError::NotFound(id)) if id == missing);
    }

    #[test]
    fn capacity_is_enforced() {
        let registry = make_registry(2);
        let (a, _ra) = connect(&registry);
        let (_b, _rb) = connect(&registry);
        let (tx, _rx) = mpsc::channel(1);
        assert_matches!(
            registry.register(tx, CancellationToken::new()),
            Err(RelayError::CapacityExceeded { limit: 2 })
        );

        assert!(registry.unregister(&a.id));
        let (tx, _rx) = mpsc::channel(1);
        assert!(registry.register(tx, CancellationToken::new()).is_ok());
    }

    #[test]
    fn unregister_is_idempotent_and_purges_topics() {
        let registry = make_registry(4);
        let (conn, _rx) = connect(&registry);
        assert!(registry.subscribe(&conn.id, "s1", "/topic/a").unwrap());
        assert!(registry.subscribe(&conn.id, "s2", "/topic/b").unwrap());

        assert!(registry.unregister(&conn.id));
        assert!(!registry.unregister(&conn.id));
        assert!(conn.is_closed());
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.router().topic_count(), 0);
    }

    #[test]
    fn subscribe_same_id_same_topic_is_noop() {
        let registry = make_registry(4);
        let (conn, _rx) = connect(&registry);
        assert!(registry.subscribe(&conn.id, "s1", "/topic/a").unwrap());
        assert!(!registry.subscribe(&conn.id, "s1", "/topic/a").unwrap());
        assert_eq!(conn.subscription_count(), 1);
    }

    #[test]
    fn subscription_id_reuse_is_protocol_violation() {
        let registry = make_registry(4);
        let (conn, _rx) = connect(&registry);
        assert!(registry.subscribe(&conn.id, "s1", "/topic/a").unwrap());
        assert_matches!(
            registry.subscribe(&conn.id, "s1", "/topic/b"),
            Err(RelayError::ProtocolViolation(_))
        );
        assert!(!registry.router().is_subscribed(&conn.id, "/topic/b"));
    }

    #[test]
    fn invalid_topic_leaves_no_subscription() {
        let registry = make_registry(4);
        let (conn, _rx) = connect(&registry);
        assert_matches!(
            registry.subscribe(&conn.id, "s1", "/queue/a"),
            Err(RelayError::InvalidTopic(_))
        );
        assert_eq!(conn.subscription_count(), 0);
    }

    #[test]
    fn subscribe_unknown_connection_is_not_found() {
        let registry = make_registry(4);
        assert_matches!(
            registry.subscribe(&ConnectionId::new(), "s1", "/topic/a"),
            Err(RelayError::NotFound(_))
        );
    }

    #[test]
    fn unsubscribe_keeps_topic_while_another_subscription_uses_it() {
        let registry = make_registry(4);
        let (conn, _rx) = connect(&registry);
        assert!(registry.subscribe(&conn.id, "s1", "/topic/a").unwrap());
        assert!(registry.subscribe(&conn.id, "s2", "/topic/a").unwrap());

        assert!(registry.unsubscribe(&conn.id, "s1").unwrap());
        assert!(registry.router().is_subscribed(&conn.id, "/topic/a"));
        assert!(registry.unsubscribe(&conn.id, "s2").unwrap());
        assert!(!registry.router().is_subscribed(&conn.id, "/topic/a"));
        assert!(!registry.unsubscribe(&conn.id, "s2").unwrap());
    }

    #[tokio::test]
    async fn publish_delivers_message_frames() {
        let registry = make_registry(4);
        let (a, mut ra) = connect(&registry);
        let (b, mut rb) = connect(&registry);
        let (c, mut rc) = connect(&registry);
        assert!(registry.subscribe(&a.id, "sub-a", "/topic/messages").unwrap());
        assert!(registry.subscribe(&b.id, "sub-b", "/topic/messages").unwrap());
        assert!(registry.subscribe(&c.id, "sub-c", "/topic/other").unwrap());

        let report = registry
            .publish("/topic/messages", &Message::new("/topic/messages", "{\"text\":\"hi\"}"))
            .unwrap();
        assert_eq!(report.delivered, 2);

        for (rx, sub) in [(&mut ra, "sub-a"), (&mut rb, "sub-b")] {
            let frame = Frame::parse(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(frame.command, Command::Message);
            assert_eq!(frame.header("subscription"), Some(sub));
            assert_eq!(frame.body, "{\"text\":\"hi\"}");
        }
        assert!(rc.try_recv().is_err());
    }

    #[test]
    fn deliver_to_unregistered_id_is_delivery_failure() {
        let registry = make_registry(4);
        let err = DeliverySink::deliver(
            &registry,
            &ConnectionId::from_raw("gone"),
            &Message::new("/topic/a", "x"),
        )
        .unwrap_err();
        assert_eq!(err.error_kind(), "delivery_failure");
    }

    #[test]
    fn close_all_cancels_everything() {
        let registry = make_registry(4);
        let (a, _ra) = connect(&registry);
        let (b, _rb) = connect(&registry);
        assert!(registry.subscribe(&a.id, "s", "/topic/a").unwrap());

        assert_eq!(registry.close_all(), 2);
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.router().topic_count(), 0);
    }
}
