//! WebSocket transport lifecycle: one connected client from upgrade
//! through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chatrelay_core::RelayError;
use futures::{Sink, SinkExt, StreamExt};
use tracing::{debug, info, instrument, warn};

use crate::config::ServerConfig;
use crate::relay::session::error_frame;
use crate::relay::{Flow, Relay};
use crate::sockjs::frames::{
    CLOSE_CAPACITY, CLOSE_GO_AWAY, HEARTBEAT_FRAME, OPEN_FRAME, close_frame, decode_messages,
    encode_messages,
};

/// How long the writer may take to flush after the reader stops.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// How STOMP text is wrapped in WebSocket messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    /// One STOMP frame per text (or UTF-8 binary) message.
    Stomp,
    /// SockJS `o`/`a[...]`/`h`/`c[...]` framing.
    SockJs,
}

impl Framing {
    fn label(self) -> &'static str {
        match self {
            Self::Stomp => "websocket",
            Self::SockJs => "sockjs_websocket",
        }
    }
}

/// Per-socket transport settings.
#[derive(Clone, Copy, Debug)]
pub struct TransportOptions {
    /// Message framing.
    pub framing: Framing,
    /// Interval between server pings (and SockJS `h` frames).
    pub ping_interval: Duration,
    /// Disconnect when the last pong is older than this.
    pub pong_timeout: Duration,
}

impl TransportOptions {
    /// Plain STOMP over WebSocket.
    pub fn stomp(config: &ServerConfig) -> Self {
        Self {
            framing: Framing::Stomp,
            ping_interval: config.heartbeat_interval(),
            pong_timeout: config.heartbeat_timeout(),
        }
    }

    /// SockJS WebSocket transport.
    pub fn sockjs(config: &ServerConfig) -> Self {
        Self {
            framing: Framing::SockJs,
            ping_interval: config.sockjs_heartbeat_interval(),
            pong_timeout: config.heartbeat_timeout().max(config.sockjs_heartbeat_interval() * 2),
        }
    }
}

/// Run a WebSocket connection.
///
/// 1. Registers with the relay, or sends an error and closes at capacity
/// 2. Feeds inbound text to the STOMP session
/// 3. Forwards the outbound queue, pinging on an interval and
///    disconnecting unresponsive clients
/// 4. Unregisters, flushes queued frames and closes
#[instrument(skip_all, fields(transport = options.framing.label()))]
pub async fn run_ws_session(ws: WebSocket, relay: Arc<Relay>, options: TransportOptions) {
    let framing = options.framing;
    let (mut session, mut send_rx) = match relay.open(framing.label()) {
        Ok(pair) => pair,
        Err(err) => {
            reject(ws, framing, &err).await;
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws.split();

    if framing == Framing::SockJs && ws_tx.send(Message::Text(OPEN_FRAME.into())).await.is_err() {
        session.close();
        return;
    }

    let connection = Arc::clone(session.connection());
    let cancel = connection.cancel_token();

    // Outbound forwarder with periodic pings. Flushes whatever is queued
    // once the connection is cancelled.
    let outbound_conn = Arc::clone(&connection);
    let mut writer = tokio::spawn(async move {
        let cancel = outbound_conn.cancel_token();
        let mut ping_interval = tokio::time::interval(options.ping_interval);
        // Skip the immediate first tick
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = send_rx.recv() => {
                    let Some(first) = msg else { break };
                    let mut batch = vec![first];
                    while let Ok(next) = send_rx.try_recv() {
                        batch.push(next);
                    }
                    if send_batch(&mut ws_tx, framing, batch).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if !outbound_conn.check_alive()
                        && outbound_conn.last_pong_elapsed() > options.pong_timeout
                    {
                        warn!(conn_id = %outbound_conn.id, "client unresponsive for {:?}, disconnecting", options.pong_timeout);
                        break;
                    }
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    if framing == Framing::SockJs
                        && ws_tx.send(Message::Text(HEARTBEAT_FRAME.into())).await.is_err()
                    {
                        break;
                    }
                }
                () = cancel.cancelled() => {
                    let mut batch = Vec::new();
                    while let Ok(next) = send_rx.try_recv() {
                        batch.push(next);
                    }
                    if !batch.is_empty() {
                        let _ = send_batch(&mut ws_tx, framing, batch).await;
                    }
                    break;
                }
            }
        }

        if framing == Framing::SockJs {
            let _ = ws_tx.send(Message::Text(close_frame(CLOSE_GO_AWAY).into())).await;
        }
        let _ = ws_tx.send(Message::Close(None)).await;
        // Wake the reader if the writer stopped first.
        outbound_conn.close();
    });

    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            () = cancel.cancelled() => break,
        };
        let text = match msg {
            Some(Ok(Message::Text(t))) => t.to_string(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => {
                    info!(conn_id = %connection.id, len = data.len(), "received non-UTF8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                connection.mark_alive();
                continue;
            }
            Some(Ok(Message::Close(_))) => {
                debug!(conn_id = %connection.id, "client sent close frame");
                break;
            }
            Some(Err(err)) => {
                let err = RelayError::TransportError(err.to_string());
                debug!(conn_id = %connection.id, error = %err, "transport failed");
                break;
            }
            None => break,
        };
        connection.mark_alive();

        let chunks = match framing {
            Framing::Stomp => vec![text],
            Framing::SockJs => match decode_messages(&text) {
                Ok(chunks) => chunks,
                Err(err) => {
                    warn!(conn_id = %connection.id, error = %err, "broken sockjs payload");
                    break;
                }
            },
        };
        let mut flow = Flow::Continue;
        for chunk in chunks {
            flow = session.on_text(&chunk).await;
            if flow == Flow::Close {
                break;
            }
        }
        if flow == Flow::Close {
            break;
        }
    }

    // Unregistering cancels the connection; the writer flushes and closes.
    session.close();
    drop(session);
    drop(connection);
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
}

async fn send_batch<S>(ws_tx: &mut S, framing: Framing, batch: Vec<String>) -> Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
{
    match framing {
        Framing::Stomp => {
            for text in batch {
                ws_tx.send(Message::Text(text.into())).await?;
            }
            Ok(())
        }
        Framing::SockJs => ws_tx.send(Message::Text(encode_messages(&batch).into())).await,
    }
}

async fn reject(mut ws: WebSocket, framing: Framing, err: &RelayError) {
    warn!(error = %err, "connection rejected");
    let text = match framing {
        Framing::Stomp => error_frame(err, None).encode(),
        Framing::SockJs => close_frame(CLOSE_CAPACITY),
    };
    let _ = ws.send(Message::Text(text.into())).await;
    let _ = ws.send(Message::Close(None)).await;
}
