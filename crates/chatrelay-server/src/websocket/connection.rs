//! Live client connection state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chatrelay_core::{Command, ConnectionId, Frame, Message, MessageId, RelayError, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// A connected client, shared between the registry and its transport task.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Send channel to the connection's write task. Carries encoded frames.
    tx: mpsc::Sender<String>,
    /// STOMP subscription id → topic.
    subscriptions: Mutex<BTreeMap<String, String>>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has responded to the last ping.
    pub is_alive: AtomicBool,
    /// When the last pong (or any activity) was received.
    last_pong: Mutex<Instant>,
    /// Count of frames dropped due to a full or closed channel.
    pub dropped_messages: AtomicU64,
    /// Cancelled when the connection is force-closed or the server stops.
    cancel: CancellationToken,
}

impl ClientConnection {
    /// Create a new connection.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<String>, cancel: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            subscriptions: Mutex::new(BTreeMap::new()),
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            cancel,
        }
    }

    /// Queue encoded text for the client.
    ///
    /// Returns `false` if the channel is full or closed, and increments
    /// the dropped message counter.
    pub fn send(&self, text: String) -> bool {
        if self.tx.try_send(text).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Encode and queue a frame.
    pub fn send_frame(&self, frame: &Frame) -> bool {
        self.send(frame.encode())
    }

    /// Enqueue one `MESSAGE` frame per subscription bound to the message's
    /// destination. Returns the number of frames queued.
    pub fn deliver(&self, message: &Message) -> Result<usize> {
        let subscription_ids: Vec<String> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|(_, topic)| topic.as_str() == message.destination())
            .map(|(id, _)| id.clone())
            .collect();

        let mut queued = 0;
        for subscription_id in subscription_ids {
            let mut frame = Frame::new(Command::Message)
                .with_header("destination", message.destination())
                .with_header("message-id", MessageId::new().as_str())
                .with_header("subscription", subscription_id);
            if let Some(content_type) = message.content_type() {
                frame = frame.with_header("content-type", content_type);
            }
            let frame = frame.with_body(message.body());

            match self.tx.try_send(frame.encode()) {
                Ok(()) => queued += 1,
                Err(err) => {
                    let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                    let reason = match err {
                        TrySendError::Full(_) => "send queue full",
                        TrySendError::Closed(_) => "connection closed",
                    };
                    return Err(RelayError::DeliveryFailure {
                        connection: self.id.clone(),
                        reason: reason.into(),
                    });
                }
            }
        }
        Ok(queued)
    }

    /// Topic bound to a subscription id.
    pub fn subscription_topic(&self, subscription_id: &str) -> Option<String> {
        self.subscriptions.lock().get(subscription_id).cloned()
    }

    /// Record a subscription. Returns `false` if the id was already bound.
    pub(crate) fn add_subscription(&self, subscription_id: &str, topic: &str) -> bool {
        let mut subs = self.subscriptions.lock();
        if subs.contains_key(subscription_id) {
            return false;
        }
        let _ = subs.insert(subscription_id.to_owned(), topic.to_owned());
        true
    }

    /// Forget a subscription, returning the topic it was bound to.
    pub(crate) fn remove_subscription(&self, subscription_id: &str) -> Option<String> {
        self.subscriptions.lock().remove(subscription_id)
    }

    /// Whether any subscription on this connection targets `topic`.
    pub fn has_topic(&self, topic: &str) -> bool {
        self.subscriptions.lock().values().any(|t| t == topic)
    }

    /// Distinct topics this connection subscribed to.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.subscriptions.lock().values().cloned().collect();
        topics.sort();
        topics.dedup();
        topics
    }

    /// Number of STOMP subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Total frames dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive (pong received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Token cancelled when this connection must stop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Force-close: signals the transport task to flush and disconnect.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether [`close`](Self::close) was called or the server is stopping.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("subscriptions", &self.subscription_count())
            .field("dropped_messages", &self.drop_count())
            .finish_non_exhaustive()
    }
}
