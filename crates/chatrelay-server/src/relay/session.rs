//! Per-connection STOMP state machine.
//!
//! ```text
//! Handshaking --CONNECT/STOMP--> Connected --DISCONNECT--> Closed
//!      |                             |
//!      +---- fatal error ------------+------------------> Closed
//! ```
//!
//! Transports feed raw text through [`StompSession::on_text`]; every reply
//! goes out through the connection's queue. Dropping the session
//! unregisters the connection.

use std::sync::Arc;

use chatrelay_core::{
    Command, ConnectionId, Destination, Frame, FrameDecoder, Message, RelayError, Result,
};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use super::Relay;
use crate::metrics::{CONNECTION_DURATION_SECONDS, FRAMES_RECEIVED_TOTAL, SESSION_ERRORS_TOTAL};
use crate::websocket::connection::ClientConnection;

/// Versions this server speaks, most preferred first.
const SUPPORTED_VERSIONS: [&str; 3] = ["1.2", "1.1", "1.0"];

/// `server` header value sent in `CONNECTED`.
const SERVER_NAME: &str = concat!("chatrelay/", env!("CARGO_PKG_VERSION"));

/// Where a session is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Transport is up; waiting for `CONNECT`.
    Handshaking,
    /// STOMP session established.
    Connected,
    /// No further frames are processed.
    Closed,
}

/// What the transport should do after feeding input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading.
    Continue,
    /// Flush queued frames and close the transport.
    Close,
}

/// STOMP protocol state for one connection.
pub struct StompSession {
    relay: Arc<Relay>,
    connection: Arc<ClientConnection>,
    state: SessionState,
    decoder: FrameDecoder,
    version: Option<&'static str>,
}

impl StompSession {
    pub(crate) fn new(relay: Arc<Relay>, connection: Arc<ClientConnection>) -> Self {
        let decoder = FrameDecoder::new(relay.max_frame_size());
        Self {
            relay,
            connection,
            state: SessionState::Handshaking,
            decoder,
            version: None,
        }
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.connection.id
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Negotiated protocol version, once connected.
    pub fn version(&self) -> Option<&'static str> {
        self.version
    }

    /// The registered connection.
    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.connection
    }

    /// Feed one transport message. It may hold several frames, or part of one.
    pub async fn on_text(&mut self, text: &str) -> Flow {
        if self.state == SessionState::Closed {
            return Flow::Close;
        }
        let frames = match self.decoder.decode(text) {
            Ok(frames) => frames,
            Err(err) => {
                self.fail(&err, None);
                return Flow::Close;
            }
        };
        for frame in frames {
            if self.on_frame(frame).await == Flow::Close {
                return Flow::Close;
            }
        }
        Flow::Continue
    }

    /// Process one decoded frame.
    pub async fn on_frame(&mut self, frame: Frame) -> Flow {
        counter!(FRAMES_RECEIVED_TOTAL, "command" => frame.command.as_str()).increment(1);
        let receipt = frame.header("receipt").map(str::to_owned);

        match self.handle_frame(&frame).await {
            Ok(()) => {
                if let Some(receipt_id) = receipt {
                    let _ = self
                        .connection
                        .send_frame(&Frame::new(Command::Receipt).with_header("receipt-id", receipt_id));
                }
            }
            Err(err) if err.closes_connection() => {
                self.fail(&err, receipt.as_deref());
            }
            Err(err) => {
                counter!(SESSION_ERRORS_TOTAL, "kind" => err.error_kind()).increment(1);
                warn!(conn_id = %self.connection.id, error = %err, "frame rejected");
                let _ = self.connection.send_frame(&error_frame(&err, receipt.as_deref()));
            }
        }

        if self.state == SessionState::Closed {
            Flow::Close
        } else {
            Flow::Continue
        }
    }

    /// Mark closed and unregister. Safe to call more than once.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.release();
    }

    fn release(&self) {
        if self.relay.registry().unregister(&self.connection.id) {
            histogram!(CONNECTION_DURATION_SECONDS).record(self.connection.age().as_secs_f64());
            info!(
                conn_id = %self.connection.id,
                duration_secs = self.connection.age().as_secs(),
                "connection closed"
            );
        }
    }

    async fn handle_frame(&mut self, frame: &Frame) -> Result<()> {
        use SessionState::{Closed, Connected, Handshaking};

        match (self.state, frame.command) {
            (Handshaking, Command::Connect | Command::Stomp) => self.handle_connect(frame),
            (_, Command::Connected | Command::Message | Command::Receipt | Command::Error) => Err(
                RelayError::ProtocolViolation(format!("{} is a server frame", frame.command)),
            ),
            (Handshaking, command) => Err(RelayError::ProtocolViolation(format!(
                "{command} before CONNECT"
            ))),
            (Connected, Command::Connect | Command::Stomp) => Err(RelayError::ProtocolViolation(
                "already connected".into(),
            )),
            (Connected, Command::Subscribe) => self.handle_subscribe(frame),
            (Connected, Command::Unsubscribe) => self.handle_unsubscribe(frame),
            (Connected, Command::Send) => self.handle_send(frame).await,
            (Connected, Command::Disconnect) => {
                debug!(conn_id = %self.connection.id, "client disconnect");
                self.state = SessionState::Closed;
                Ok(())
            }
            (Connected, command) => {
                debug!(conn_id = %self.connection.id, %command, "ignored");
                Ok(())
            }
            (Closed, _) => Err(RelayError::ProtocolViolation("session closed".into())),
        }
    }

    fn handle_connect(&mut self, frame: &Frame) -> Result<()> {
        let accepted = frame.header("accept-version").unwrap_or("1.0");
        let version = negotiate_version(accepted).ok_or_else(|| {
            RelayError::ProtocolViolation(format!(
                "no supported version in '{accepted}' (server speaks {})",
                SUPPORTED_VERSIONS.join(",")
            ))
        })?;

        self.state = SessionState::Connected;
        self.version = Some(version);
        let connected = Frame::new(Command::Connected)
            .with_header("version", version)
            .with_header("heart-beat", "0,0")
            .with_header("server", SERVER_NAME)
            .with_header("session", self.connection.id.as_str());
        let _ = self.connection.send_frame(&connected);
        info!(conn_id = %self.connection.id, version, "stomp session established");
        Ok(())
    }

    fn handle_subscribe(&self, frame: &Frame) -> Result<()> {
        let topic = frame.require_header("destination")?;
        let subscription_id = self.subscription_id(frame, Some(topic))?;
        let _ = self
            .relay
            .registry()
            .subscribe(&self.connection.id, subscription_id, topic)?;
        debug!(conn_id = %self.connection.id, subscription_id, topic, "subscribe");
        Ok(())
    }

    fn handle_unsubscribe(&self, frame: &Frame) -> Result<()> {
        let subscription_id = self.subscription_id(frame, frame.header("destination"))?;
        let removed = self
            .relay
            .registry()
            .unsubscribe(&self.connection.id, subscription_id)?;
        debug!(conn_id = %self.connection.id, subscription_id, removed, "unsubscribe");
        Ok(())
    }

    /// The `id` header. STOMP 1.0 clients may omit it; the destination
    /// stands in.
    fn subscription_id<'a>(&self, frame: &'a Frame, fallback: Option<&'a str>) -> Result<&'a str> {
        match (frame.header("id"), self.version, fallback) {
            (Some(id), _, _) => Ok(id),
            (None, Some("1.0"), Some(fallback)) => Ok(fallback),
            _ => frame.require_header("id"),
        }
    }

    async fn handle_send(&self, frame: &Frame) -> Result<()> {
        let destination = frame.require_header("destination")?;
        let message = Message::from_send_frame(destination, frame);

        match self.relay.policy().classify(destination)? {
            Destination::Broadcast(topic) => {
                let _ = self.relay.publish(&topic, &message)?;
            }
            Destination::Application(path) => {
                if !self.relay.routes().has_route(&path) {
                    return Err(RelayError::UnknownDestination(destination.to_owned()));
                }
                let cancel = self.connection.cancel_token();
                let processed = tokio::select! {
                    result = self.process(&path, message) => result?,
                    () = cancel.cancelled() => return Err(RelayError::Cancelled),
                };
                if let Some(output) = processed {
                    let _ = self.relay.publish(output.destination(), &output)?;
                }
            }
        }
        Ok(())
    }

    async fn process(&self, path: &str, message: Message) -> Result<Option<Message>> {
        let delay = self.relay.processing_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.relay.routes().dispatch(path, message).await
    }

    fn fail(&mut self, err: &RelayError, receipt: Option<&str>) {
        counter!(SESSION_ERRORS_TOTAL, "kind" => err.error_kind()).increment(1);
        warn!(conn_id = %self.connection.id, error = %err, "closing session");
        let _ = self.connection.send_frame(&error_frame(err, receipt));
        self.state = SessionState::Closed;
    }
}

impl std::fmt::Debug for StompSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StompSession")
            .field("id", &self.connection.id)
            .field("state", &self.state)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl Drop for StompSession {
    fn drop(&mut self) {
        self.release();
    }
}

/// `ERROR` frame for `err`, echoing the offending frame's receipt.
pub fn error_frame(err: &RelayError, receipt: Option<&str>) -> Frame {
    let mut frame = Frame::error(err.error_kind(), err.to_string());
    if let Some(receipt_id) = receipt {
        frame = frame.with_header("receipt-id", receipt_id);
    }
    frame
}

/// Highest version present in a comma separated `accept-version` list.
pub fn negotiate_version(accepted: &str) -> Option<&'static str> {
    let offered: Vec<&str> = accepted.split(',').map(str::trim).collect();
    SUPPORTED_VERSIONS
        .into_iter()
        .find(|v| offered.contains(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::relay::RouteTable;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn make_relay(delay_ms: u64) -> Arc<Relay> {
        let config = ServerConfig {
            processing_delay_ms: delay_ms,
            ..ServerConfig::default()
        };
        Arc::new(Relay::new(&config, RouteTable::chat(), CancellationToken::new()).unwrap())
    }

    fn next_frame(rx: &mut mpsc::Receiver<String>) -> Frame {
        Frame::parse(&rx.try_recv().unwrap()).unwrap()
    }

    async fn connected(relay: &Arc<Relay>) -> (StompSession, mpsc::Receiver<String>) {
        let (mut session, mut rx) = relay.open("test").unwrap();
        let flow = session
            .on_text("CONNECT\naccept-version:1.1,1.2\nhost:localhost\n\n\0")
            .await;
        assert_eq!(flow, Flow::Continue);
        let frame = next_frame(&mut rx);
        assert_eq!(frame.command, Command::Connected);
        (session, rx)
    }

    #[test]
    fn version_negotiation_picks_highest() {
        assert_eq!(negotiate_version("1.0,1.1,1.2"), Some("1.2"));
        assert_eq!(negotiate_version("1.1, 1.0"), Some("1.1"));
        assert_eq!(negotiate_version("1.0"), Some("1.0"));
        assert_eq!(negotiate_version("2.0"), None);
    }

    #[tokio::test]
    async fn connect_replies_connected() {
        let relay = make_relay(0);
        let (mut session, mut rx) = relay.open("test").unwrap();
        assert_eq!(session.state(), SessionState::Handshaking);
        let _ = session.on_text("STOMP\naccept-version:1.2\n\n\0").await;

        let frame = next_frame(&mut rx);
        assert_eq!(frame.command, Command::Connected);
        assert_eq!(frame.header("version"), Some("1.2"));
        assert_eq!(frame.header("heart-beat"), Some("0,0"));
        assert_eq!(frame.header("session"), Some(session.id().as_str()));
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.version(), Some("1.2"));
    }

    #[tokio::test]
    async fn connect_without_accept_version_is_1_0() {
        let relay = make_relay(0);
        let (mut session, mut rx) = relay.open("test").unwrap();
        let _ = session.on_text("CONNECT\n\n\0").await;
        assert_eq!(next_frame(&mut rx).header("version"), Some("1.0"));
    }

    #[tokio::test]
    async fn unsupported_version_closes() {
        let relay = make_relay(0);
        let (mut session, mut rx) = relay.open("test").unwrap();
        let flow = session.on_text("CONNECT\naccept-version:9.9\n\n\0").await;
        assert_eq!(flow, Flow::Close);
        assert_eq!(next_frame(&mut rx).command, Command::Error);
    }

    #[tokio::test]
    async fn send_before_connect_is_protocol_violation() {
        let relay = make_relay(0);
        let (mut session, mut rx) = relay.open("test").unwrap();
        let flow = session
            .on_text("SEND\ndestination:/app/chat\n\n{\"text\":\"hi\"}\0")
            .await;
        assert_eq!(flow, Flow::Close);
        assert_eq!(session.state(), SessionState::Closed);

        let frame = next_frame(&mut rx);
        assert_eq!(frame.command, Command::Error);
        assert_eq!(frame.header("message"), Some("protocol_violation"));
    }

    #[tokio::test]
    async fn malformed_input_closes() {
        let relay = make_relay(0);
        let (mut session, mut rx) = connected(&relay).await;
        let flow = session.on_text("BOGUS\n\n\0").await;
        assert_eq!(flow, Flow::Close);
        assert_eq!(next_frame(&mut rx).header("message"), Some("malformed_frame"));
    }

    #[tokio::test]
    async fn subscribe_then_receive_broadcast() {
        let relay = make_relay(0);
        let (mut session, mut rx) = connected(&relay).await;
        let flow = session
            .on_text("SUBSCRIBE\nid:sub-0\ndestination:/topic/messages\nreceipt:r1\n\n\0")
            .await;
        assert_eq!(flow, Flow::Continue);
        let receipt = next_frame(&mut rx);
        assert_eq!(receipt.command, Command::Receipt);
        assert_eq!(receipt.header("receipt-id"), Some("r1"));

        let _ = relay
            .publish("/topic/messages", &Message::new("/topic/messages", "hello"))
            .unwrap();
        let msg = next_frame(&mut rx);
        assert_eq!(msg.command, Command::Message);
        assert_eq!(msg.header("subscription"), Some("sub-0"));
        assert_eq!(msg.body, "hello");
    }

    #[tokio::test]
    async fn invalid_topic_keeps_connection_open() {
        let relay = make_relay(0);
        let (mut session, mut rx) = connected(&relay).await;
        let flow = session
            .on_text("SUBSCRIBE\nid:s\ndestination:/queue/x\n\n\0")
            .await;
        assert_eq!(flow, Flow::Continue);
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(next_frame(&mut rx).header("message"), Some("invalid_topic"));
    }

    #[tokio::test]
    async fn unknown_application_destination_keeps_connection_open() {
        let relay = make_relay(0);
        let (mut session, mut rx) = connected(&relay).await;
        let flow = session
            .on_text("SEND\ndestination:/app/nope\nreceipt:r9\n\nx\0")
            .await;
        assert_eq!(flow, Flow::Continue);
        let err = next_frame(&mut rx);
        assert_eq!(err.header("message"), Some("unknown_destination"));
        assert_eq!(err.header("receipt-id"), Some("r9"));
    }

    #[tokio::test]
    async fn send_to_app_destination_broadcasts_through_route() {
        let relay = make_relay(0);
        let (mut sender, mut sender_rx) = connected(&relay).await;
        let (mut other, mut other_rx) = connected(&relay).await;
        for session in [&mut sender, &mut other] {
            let _ = session
                .on_text("SUBSCRIBE\nid:0\ndestination:/topic/messages\n\n\0")
                .await;
        }

        let _ = sender
            .on_text("SEND\ndestination:/app/chat\ncontent-type:application/json\n\n{\"text\":\"hi\"}\0")
            .await;

        for rx in [&mut sender_rx, &mut other_rx] {
            let frame = next_frame(rx);
            assert_eq!(frame.command, Command::Message);
            assert_eq!(frame.header("destination"), Some("/topic/messages"));
            assert_eq!(frame.header("content-type"), Some("application/json"));
            assert_eq!(frame.body, "{\"text\":\"hi\"}");
        }
    }

    #[tokio::test]
    async fn send_to_topic_publishes_directly() {
        let relay = make_relay(0);
        let (mut session, mut rx) = connected(&relay).await;
        let _ = session
            .on_text("SUBSCRIBE\nid:0\ndestination:/topic/raw\n\n\0")
            .await;
        let _ = session.on_text("SEND\ndestination:/topic/raw\n\nverbatim\0").await;
        assert_eq!(next_frame(&mut rx).body, "verbatim");
    }

    #[tokio::test(start_paused = true)]
    async fn processing_delay_is_applied() {
        let relay = make_relay(100);
        let (mut session, mut rx) = connected(&relay).await;
        let _ = session
            .on_text("SUBSCRIBE\nid:0\ndestination:/topic/messages\n\n\0")
            .await;

        let start = tokio::time::Instant::now();
        let _ = session.on_text("SEND\ndestination:/app/chat\n\nx\0").await;
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(next_frame(&mut rx).body, "x");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_delay_drops_message_and_closes() {
        let relay = make_relay(60_000);
        let (mut session, mut rx) = connected(&relay).await;
        let _ = session
            .on_text("SUBSCRIBE\nid:0\ndestination:/topic/messages\n\n\0")
            .await;

        let connection = Arc::clone(session.connection());
        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            connection.close();
        });
        let flow = session.on_text("SEND\ndestination:/app/chat\n\nx\0").await;
        closer.await.unwrap();

        assert_eq!(flow, Flow::Close);
        let frame = next_frame(&mut rx);
        assert_eq!(frame.command, Command::Error);
        assert_eq!(frame.header("message"), Some("cancelled"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let relay = make_relay(0);
        let (mut session, mut rx) = connected(&relay).await;
        let _ = session
            .on_text("SUBSCRIBE\nid:0\ndestination:/topic/messages\n\n\0")
            .await;
        let _ = session.on_text("UNSUBSCRIBE\nid:0\n\n\0").await;
        assert_eq!(relay.router().topic_count(), 0);

        let report = relay
            .publish("/topic/messages", &Message::new("/topic/messages", "x"))
            .unwrap();
        assert_eq!(report.recipients, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stomp_1_0_subscription_without_id() {
        let relay = make_relay(0);
        let (mut session, _rx) = relay.open("test").unwrap();
        let _ = session.on_text("CONNECT\n\n\0").await;
        let flow = session
            .on_text("SUBSCRIBE\ndestination:/topic/messages\n\n\0")
            .await;
        assert_eq!(flow, Flow::Continue);
        assert!(relay.router().is_subscribed(session.id(), "/topic/messages"));
    }

    #[tokio::test]
    async fn subscribe_without_id_on_1_2_closes() {
        let relay = make_relay(0);
        let (mut session, _rx) = connected(&relay).await;
        let flow = session
            .on_text("SUBSCRIBE\ndestination:/topic/messages\n\n\0")
            .await;
        assert_eq!(flow, Flow::Close);
    }

    #[tokio::test]
    async fn disconnect_sends_receipt_then_closes() {
        let relay = make_relay(0);
        let (mut session, mut rx) = connected(&relay).await;
        let flow = session.on_text("DISCONNECT\nreceipt:bye\n\n\0").await;
        assert_eq!(flow, Flow::Close);
        let frame = next_frame(&mut rx);
        assert_eq!(frame.command, Command::Receipt);
        assert_eq!(frame.header("receipt-id"), Some("bye"));
    }

    #[tokio::test]
    async fn frames_split_across_messages() {
        let relay = make_relay(0);
        let (mut session, mut rx) = relay.open("test").unwrap();
        assert_eq!(session.on_text("CONNECT\naccept-ver").await, Flow::Continue);
        assert!(rx.try_recv().is_err());
        let _ = session.on_text("sion:1.2\n\n\0").await;
        assert_eq!(next_frame(&mut rx).command, Command::Connected);
    }

    #[tokio::test]
    async fn drop_unregisters_and_purges() {
        let relay = make_relay(0);
        let (mut session, _rx) = connected(&relay).await;
        let _ = session
            .on_text("SUBSCRIBE\nid:0\ndestination:/topic/messages\n\n\0")
            .await;
        let id = session.id().clone();
        drop(session);
        assert!(relay.registry().lookup(&id).is_err());
        assert_eq!(relay.router().subscriber_count("/topic/messages"), 0);
    }
}
