//! SockJS fallback transport.
//!
//! Served under the relay endpoint:
//!
//! | Route | |
//! |---|---|
//! | `GET {endpoint}/info` | server capabilities |
//! | `GET {endpoint}/{server}/{session}/websocket` | SockJS-framed WebSocket |
//! | `POST {endpoint}/{server}/{session}/xhr` | long-poll for outbound frames |
//! | `POST {endpoint}/{server}/{session}/xhr_send` | inbound frames |

pub mod frames;
pub mod polling;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

use crate::server::AppState;
use crate::websocket::{TransportOptions, run_ws_session};

pub use polling::{PollingSessions, XhrSendError};

const JAVASCRIPT_CONTENT_TYPE: &str = "application/javascript;charset=UTF-8";
const NO_CACHE: &str = "no-store, no-cache, no-transform, must-revalidate, max-age=0";

/// `GET {endpoint}/info` body.
#[derive(Debug, Clone, Serialize)]
pub struct InfoResponse {
    /// WebSocket transport available.
    pub websocket: bool,
    /// Sticky-session cookie required.
    pub cookie_needed: bool,
    /// Allowed origins.
    pub origins: Vec<String>,
    /// Random value clients use to seed their own ids.
    pub entropy: u32,
}

/// Capabilities advertised to SockJS clients.
pub fn info() -> InfoResponse {
    InfoResponse {
        websocket: true,
        cookie_needed: false,
        origins: vec!["*:*".into()],
        entropy: rand::random(),
    }
}

/// Server and session path segments must be non-empty and dot-free.
fn valid_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.contains('.')
}

/// GET {endpoint}/info
pub(crate) async fn info_handler() -> Response {
    ([(header::CACHE_CONTROL, NO_CACHE)], Json(info())).into_response()
}

/// GET {endpoint}/{server}/{session}/websocket
pub(crate) async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path((server_id, session_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Response {
    if !valid_segment(&server_id) || !valid_segment(&session_id) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let relay = state.relay.clone();
    let options = TransportOptions::sockjs(&state.config);
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, relay, options))
}

/// POST {endpoint}/{server}/{session}/xhr
pub(crate) async fn xhr_handler(
    Path((server_id, session_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Response {
    if !valid_segment(&server_id) || !valid_segment(&session_id) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let body = state.polling.poll(&session_id).await;
    (
        [
            (header::CONTENT_TYPE, JAVASCRIPT_CONTENT_TYPE),
            (header::CACHE_CONTROL, NO_CACHE),
        ],
        body,
    )
        .into_response()
}

/// POST {endpoint}/{server}/{session}/xhr_send
pub(crate) async fn xhr_send_handler(
    Path((server_id, session_id)): Path<(String, String)>,
    State(state): State<AppState>,
    body: String,
) -> Response {
    if !valid_segment(&server_id) || !valid_segment(&session_id) {
        return StatusCode::NOT_FOUND.into_response();
    }
    match state.polling.send(&session_id, &body).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(XhrSendError::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(XhrSendError::EmptyPayload) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "Payload expected.").into_response()
        }
        Err(XhrSendError::BrokenJson(_)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "Broken JSON encoding.").into_response()
        }
    }
}
