//! Topic subscription map and snapshot fan-out.

use std::collections::{HashMap, HashSet};

use chatrelay_core::{ConnectionId, DestinationPolicy, Message, RelayError, Result};
use metrics::{counter, histogram};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::metrics::{DELIVERIES_FAILED_TOTAL, MESSAGES_PUBLISHED_TOTAL, PUBLISH_FANOUT};

/// Hands a published message to one subscriber.
pub trait DeliverySink: Send + Sync {
    /// Deliver `message` to `connection`. Returns the number of frames queued.
    fn deliver(&self, connection: &ConnectionId, message: &Message) -> Result<usize>;
}

/// Outcome of one [`TopicRouter::publish`].
#[derive(Debug, Default)]
pub struct PublishReport {
    /// Subscribers in the snapshot taken at publish time.
    pub recipients: usize,
    /// Subscribers the message was handed to.
    pub delivered: usize,
    /// Per-subscriber failures. These never fail the publish itself.
    pub failures: Vec<RelayError>,
}

/// Maps topics to the connections subscribed to them.
///
/// Topics exist only while they have subscribers. Publishing snapshots the
/// subscriber set under the read lock and delivers outside it, so a
/// subscription change racing a publish never blocks delivery.
#[derive(Debug, Default)]
pub struct TopicRouter {
    topics: RwLock<HashMap<String, HashSet<ConnectionId>>>,
    policy: DestinationPolicy,
}

impl TopicRouter {
    /// Create a router enforcing `policy` on topic names.
    pub fn new(policy: DestinationPolicy) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// Topic naming policy.
    pub fn policy(&self) -> &DestinationPolicy {
        &self.policy
    }

    /// Add `connection` to `topic`. Returns `true` if it was not subscribed.
    pub fn subscribe(&self, connection: &ConnectionId, topic: &str) -> Result<bool> {
        let topic = self.policy.validate_topic(topic)?;
        let added = self
            .topics
            .write()
            .entry(topic.to_owned())
            .or_default()
            .insert(connection.clone());
        if added {
            debug!(conn_id = %connection, topic, "subscribed");
        }
        Ok(added)
    }

    /// Remove `connection` from `topic`. No-op if it was not subscribed.
    pub fn unsubscribe(&self, connection: &ConnectionId, topic: &str) -> bool {
        let mut topics = self.topics.write();
        let Some(subscribers) = topics.get_mut(topic) else {
            return false;
        };
        let removed = subscribers.remove(connection);
        if subscribers.is_empty() {
            let _ = topics.remove(topic);
        }
        if removed {
            debug!(conn_id = %connection, topic, "unsubscribed");
        }
        removed
    }

    /// Deliver `message` to every subscriber of `topic` at call time.
    ///
    /// A message addressed elsewhere is re-addressed to `topic`. Fails only
    /// when the topic name itself is invalid.
    pub fn publish(
        &self,
        topic: &str,
        message: &Message,
        sink: &dyn DeliverySink,
    ) -> Result<PublishReport> {
        let topic = self.policy.validate_topic(topic)?;
        let readdressed;
        let message = if message.destination() == topic {
            message
        } else {
            readdressed = message.readdressed(topic);
            &readdressed
        };

        let snapshot = self.subscribers(topic);
        let mut report = PublishReport {
            recipients: snapshot.len(),
            ..PublishReport::default()
        };
        for connection in &snapshot {
            match sink.deliver(connection, message) {
                Ok(_) => report.delivered += 1,
                Err(err) => {
                    warn!(conn_id = %connection, topic, error = %err, "delivery failed");
                    counter!(DELIVERIES_FAILED_TOTAL).increment(1);
                    report.failures.push(err);
                }
            }
        }

        counter!(MESSAGES_PUBLISHED_TOTAL).increment(1);
        #[allow(clippy::cast_precision_loss)]
        histogram!(PUBLISH_FANOUT).record(report.delivered as f64);
        debug!(
            topic,
            recipients = report.recipients,
            delivered = report.delivered,
            "published"
        );
        Ok(report)
    }

    /// Purge `connection` from every topic in one critical section.
    /// Returns the number of topics it was removed from.
    pub fn remove_connection(&self, connection: &ConnectionId) -> usize {
        let mut topics = self.topics.write();
        let mut purged = 0;
        topics.retain(|_, subscribers| {
            if subscribers.remove(connection) {
                purged += 1;
            }
            !subscribers.is_empty()
        });
        purged
    }

    /// Current subscribers of `topic`.
    pub fn subscribers(&self, topic: &str) -> Vec<ConnectionId> {
        self.topics
            .read()
            .get(topic)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `connection` is subscribed to `topic`.
    pub fn is_subscribed(&self, connection: &ConnectionId, topic: &str) -> bool {
        self.topics
            .read()
            .get(topic)
            .is_some_and(|s| s.contains(connection))
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    /// Number of subscribers of `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map_or(0, HashSet::len)
    }

    /// Names of all live topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records deliveries; ids listed in `failing` are rejected.
    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<(ConnectionId, Message)>>,
        failing: Vec<ConnectionId>,
    }

    impl DeliverySink for RecordingSink {
        fn deliver(&self, connection: &ConnectionId, message: &Message) -> Result<usize> {
            if self.failing.contains(connection) {
                return Err(RelayError::DeliveryFailure {
                    connection: connection.clone(),
                    reason: "send queue full".into(),
                });
            }
            self.delivered.lock().push((connection.clone(), message.clone()));
            Ok(1)
        }
    }

    fn id(s: &str) -> ConnectionId {
        ConnectionId::from_raw(s)
    }

    #[test]
    fn subscribe_is_idempotent() {
        let router = TopicRouter::default();
        assert!(router.subscribe(&id("a"), "/topic/messages").unwrap());
        assert!(!router.subscribe(&id("a"), "/topic/messages").unwrap());
        assert_eq!(router.subscriber_count("/topic/messages"), 1);
    }

    #[test]
    fn subscribe_rejects_invalid_topic() {
        let router = TopicRouter::default();
        for bad in ["/app/chat", "/topic", "/topic/", "/topic//x", "/topic/a b", "/topic/*"] {
            let err = router.subscribe(&id("a"), bad).unwrap_err();
            assert!(matches!(err, RelayError::InvalidTopic(_)), "{bad}");
        }
        assert_eq!(router.topic_count(), 0);
    }

    #[test]
    fn unsubscribe_not_subscribed_is_noop() {
        let router = TopicRouter::default();
        assert!(!router.unsubscribe(&id("a"), "/topic/messages"));
        router.subscribe(&id("b"), "/topic/messages").unwrap();
        assert!(!router.unsubscribe(&id("a"), "/topic/messages"));
        assert_eq!(router.subscribers("/topic/messages"), vec![id("b")]);
    }

    #[test]
    fn empty_topic_is_removed() {
        let router = TopicRouter::default();
        router.subscribe(&id("a"), "/topic/messages").unwrap();
        assert_eq!(router.topic_count(), 1);
        assert!(router.unsubscribe(&id("a"), "/topic/messages"));
        assert_eq!(router.topic_count(), 0);
    }

    #[test]
    fn publish_reaches_only_subscribers() {
        let router = TopicRouter::default();
        router.subscribe(&id("a"), "/topic/messages").unwrap();
        router.subscribe(&id("b"), "/topic/messages").unwrap();
        router.subscribe(&id("c"), "/topic/other").unwrap();

        let sink = RecordingSink::default();
        let msg = Message::new("/topic/messages", "{\"text\":\"hi\"}");
        let report = router.publish("/topic/messages", &msg, &sink).unwrap();
        assert_eq!(report.recipients, 2);
        assert_eq!(report.delivered, 2);
        assert!(report.failures.is_empty());

        let mut got: Vec<String> = sink
            .delivered
            .lock()
            .iter()
            .map(|(c, m)| {
                assert_eq!(m.body(), "{\"text\":\"hi\"}");
                c.to_string()
            })
            .collect();
        got.sort();
        assert_eq!(got, vec!["a", "b"]);
    }

    #[test]
    fn publish_to_topic_without_subscribers_delivers_nothing() {
        let router = TopicRouter::default();
        let sink = RecordingSink::default();
        let report = router
            .publish("/topic/empty", &Message::new("/topic/empty", "x"), &sink)
            .unwrap();
        assert_eq!(report.recipients, 0);
        assert_eq!(report.delivered, 0);
    }

    #[test]
    fn publish_readdresses_message() {
        let router = TopicRouter::default();
        router.subscribe(&id("a"), "/topic/messages").unwrap();
        let sink = RecordingSink::default();
        let _ = router
            .publish("/topic/messages", &Message::new("/app/chat", "x"), &sink)
            .unwrap();
        assert_eq!(sink.delivered.lock()[0].1.destination(), "/topic/messages");
    }

    #[test]
    fn delivery_failure_does_not_fail_publish() {
        let router = TopicRouter::default();
        router.subscribe(&id("ok"), "/topic/t").unwrap();
        router.subscribe(&id("slow"), "/topic/t").unwrap();
        let sink = RecordingSink {
            failing: vec![id("slow")],
            ..RecordingSink::default()
        };
        let report = router
            .publish("/topic/t", &Message::new("/topic/t", "x"), &sink)
            .unwrap();
        assert_eq!(report.recipients, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].error_kind(), "delivery_failure");
    }

    #[test]
    fn publish_to_invalid_topic_fails() {
        let router = TopicRouter::default();
        let sink = RecordingSink::default();
        let err = router
            .publish("/queue/x", &Message::new("/queue/x", "x"), &sink)
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidTopic(_)));
    }

    #[test]
    fn remove_connection_purges_everywhere() {
        let router = TopicRouter::default();
        router.subscribe(&id("a"), "/topic/one").unwrap();
        router.subscribe(&id("a"), "/topic/two").unwrap();
        router.subscribe(&id("b"), "/topic/two").unwrap();

        assert_eq!(router.remove_connection(&id("a")), 2);
        assert!(!router.is_subscribed(&id("a"), "/topic/one"));
        assert!(!router.is_subscribed(&id("a"), "/topic/two"));
        assert_eq!(router.topics(), vec!["/topic/two".to_owned()]);
        assert_eq!(router.remove_connection(&id("a")), 0);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Clone, Debug)]
        enum Op {
            Subscribe(usize, usize),
            Unsubscribe(usize, usize),
            Remove(usize),
        }

        const TOPICS: [&str; 3] = ["/topic/a", "/topic/b", "/topic/c/d"];

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0..4usize, 0..3usize).prop_map(|(c, t)| Op::Subscribe(c, t)),
                (0..4usize, 0..3usize).prop_map(|(c, t)| Op::Unsubscribe(c, t)),
                (0..4usize).prop_map(Op::Remove),
            ]
        }

        proptest! {
            #[test]
            fn removed_connection_is_in_no_topic(ops in prop::collection::vec(op(), 0..64), victim in 0..4usize) {
                let router = TopicRouter::default();
                let ids: Vec<ConnectionId> = (0..4).map(|i| id(&format!("c{i}"))).collect();
                for op in ops {
                    match op {
                        Op::Subscribe(c, t) => { let _ = router.subscribe(&ids[c], TOPICS[t]).unwrap(); }
                        Op::Unsubscribe(c, t) => { let _ = router.unsubscribe(&ids[c], TOPICS[t]); }
                        Op::Remove(c) => { let _ = router.remove_connection(&ids[c]); }
                    }
                }
                let _ = router.remove_connection(&ids[victim]);
                for topic in TOPICS {
                    prop_assert!(!router.is_subscribed(&ids[victim], topic));
                }
                for topic in router.topics() {
                    prop_assert!(router.subscriber_count(&topic) > 0);
                }
            }
        }
    }
}
