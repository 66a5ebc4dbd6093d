//! XHR polling sessions.
//!
//! A polling session is a relay connection whose inbound text arrives via
//! `xhr_send` and whose outbound queue is drained by `xhr` long-polls. Only
//! one poll may hold the queue at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frames::{
    CLOSE_ANOTHER_CONNECTION, CLOSE_CAPACITY, CLOSE_GO_AWAY, HEARTBEAT_FRAME, OPEN_FRAME,
    close_frame, decode_messages, encode_messages,
};
use crate::relay::{Flow, Relay, StompSession};

/// Inbound chunks buffered between `xhr_send` and the session task.
const INBOUND_CAPACITY: usize = 64;

/// Floor for the idle-check period; `interval_at` rejects zero.
const MIN_DISCONNECT_DELAY: Duration = Duration::from_millis(1);

/// Why an `xhr_send` was refused.
#[derive(Debug, thiserror::Error)]
pub enum XhrSendError {
    /// No open session under this id.
    #[error("session not found")]
    NotFound,
    /// Empty request body.
    #[error("payload expected")]
    EmptyPayload,
    /// Body is not a JSON array of strings.
    #[error("broken JSON encoding: {0}")]
    BrokenJson(#[from] serde_json::Error),
}

struct PollingSession {
    key: String,
    inbound: mpsc::Sender<String>,
    outbound: Mutex<mpsc::Receiver<String>>,
    last_activity: parking_lot::Mutex<Instant>,
    polling: AtomicBool,
    cancel: CancellationToken,
}

impl PollingSession {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// No poll in flight and none for `delay`.
    fn is_idle(&self, delay: Duration) -> bool {
        !self.polling.load(Ordering::Acquire) && self.last_activity.lock().elapsed() >= delay
    }
}

/// Marks a poll in flight; cleared even if the request future is dropped.
struct PollGuard<'a>(&'a PollingSession);

impl<'a> PollGuard<'a> {
    fn new(session: &'a PollingSession) -> Self {
        session.polling.store(true, Ordering::Release);
        Self(session)
    }
}

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.touch();
        self.0.polling.store(false, Ordering::Release);
    }
}

/// All XHR polling sessions of one server.
pub struct PollingSessions {
    sessions: DashMap<String, Arc<PollingSession>>,
    relay: Arc<Relay>,
    poll_timeout: Duration,
    disconnect_delay: Duration,
}

impl PollingSessions {
    /// `poll_timeout` bounds how long a poll waits before answering `h`;
    /// sessions unpolled for `disconnect_delay` are closed. A zero delay is
    /// raised to one millisecond.
    pub fn new(relay: Arc<Relay>, poll_timeout: Duration, disconnect_delay: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            relay,
            poll_timeout,
            disconnect_delay: disconnect_delay.max(MIN_DISCONNECT_DELAY),
        }
    }

    /// Number of sessions, including closed ones awaiting their final poll.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Answer an `xhr` request. The first poll opens the session.
    ///
    /// The returned body is newline terminated.
    pub async fn poll(self: &Arc<Self>, key: &str) -> String {
        let existing = self.sessions.get(key).map(|e| Arc::clone(e.value()));
        let mut frame = match existing {
            Some(session) => self.poll_session(&session).await,
            None => self.open(key),
        };
        frame.push('\n');
        frame
    }

    /// Feed an `xhr_send` body to the session.
    pub async fn send(&self, key: &str, body: &str) -> Result<(), XhrSendError> {
        let session = self
            .sessions
            .get(key)
            .map(|e| Arc::clone(e.value()))
            .ok_or(XhrSendError::NotFound)?;
        if session.is_closed() {
            return Err(XhrSendError::NotFound);
        }
        if body.trim().is_empty() {
            return Err(XhrSendError::EmptyPayload);
        }
        let messages = decode_messages(body)?;
        session.touch();
        for message in messages {
            session
                .inbound
                .send(message)
                .await
                .map_err(|_| XhrSendError::NotFound)?;
        }
        Ok(())
    }

    fn open(self: &Arc<Self>, key: &str) -> String {
        let Entry::Vacant(slot) = self.sessions.entry(key.to_owned()) else {
            return close_frame(CLOSE_ANOTHER_CONNECTION);
        };
        let (stomp, outbound) = match self.relay.open("xhr") {
            Ok(pair) => pair,
            Err(err) => {
                warn!(session = key, error = %err, "polling session rejected");
                return close_frame(CLOSE_CAPACITY);
            }
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let session = Arc::new(PollingSession {
            key: key.to_owned(),
            inbound: inbound_tx,
            outbound: Mutex::new(outbound),
            last_activity: parking_lot::Mutex::new(Instant::now()),
            polling: AtomicBool::new(false),
            cancel: stomp.connection().cancel_token(),
        });
        let _ = slot.insert(Arc::clone(&session));
        debug!(session = key, conn_id = %stomp.id(), "polling session opened");

        let _task = tokio::spawn(run_session(stomp, inbound_rx, session, Arc::clone(self)));
        OPEN_FRAME.to_owned()
    }

    async fn poll_session(&self, session: &Arc<PollingSession>) -> String {
        let Ok(mut outbound) = session.outbound.try_lock() else {
            return close_frame(CLOSE_ANOTHER_CONNECTION);
        };
        let _guard = PollGuard::new(session);

        let mut batch = drain(&mut outbound);
        if batch.is_empty() && !session.is_closed() {
            tokio::select! {
                message = outbound.recv() => {
                    if let Some(message) = message {
                        batch.push(message);
                        batch.extend(drain(&mut outbound));
                    }
                }
                () = tokio::time::sleep(self.poll_timeout) => {
                    return HEARTBEAT_FRAME.to_owned();
                }
                () = session.cancel.cancelled() => {
                    batch = drain(&mut outbound);
                }
            }
        }

        if !batch.is_empty() {
            return encode_messages(&batch);
        }
        // Closed and fully drained: this is the session's last answer.
        let _ = self
            .sessions
            .remove_if(&session.key, |_, s| Arc::ptr_eq(s, session));
        close_frame(CLOSE_GO_AWAY)
    }
}

fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(message);
    }
    out
}

async fn run_session(
    mut stomp: StompSession,
    mut inbound: mpsc::Receiver<String>,
    session: Arc<PollingSession>,
    sessions: Arc<PollingSessions>,
) {
    let delay = sessions.disconnect_delay;
    let cancel = session.cancel.clone();
    let mut idle_check = tokio::time::interval_at(Instant::now() + delay, delay);

    loop {
        tokio::select! {
            text = inbound.recv() => match text {
                Some(text) => {
                    session.touch();
                    if stomp.on_text(&text).await == Flow::Close {
                        break;
                    }
                }
                None => break,
            },
            _ = idle_check.tick() => {
                if session.is_idle(delay) {
                    info!(session = %session.key, "polling session expired");
                    break;
                }
            }
            () = cancel.cancelled() => break,
        }
    }

    stomp.close();
    drop(stomp);

    // Leave the entry so a final poll can collect queued frames and the
    // close frame, then forget it.
    tokio::time::sleep(delay).await;
    let _ = sessions
        .sessions
        .remove_if(&session.key, |_, s| Arc::ptr_eq(s, &session));
}
