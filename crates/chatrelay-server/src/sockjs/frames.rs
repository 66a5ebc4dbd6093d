//! SockJS wire framing.
//!
//! Server → client: `o` (open), `h` (heartbeat), `a[...]` (JSON array of
//! messages), `c[code,"reason"]` (close). Client → server: a JSON array of
//! strings (or a single JSON string).

use serde_json::json;

/// Session opened.
pub const OPEN_FRAME: &str = "o";

/// Keep-alive.
pub const HEARTBEAT_FRAME: &str = "h";

/// Close code sent when the server goes away.
pub const CLOSE_GO_AWAY: (u16, &str) = (3000, "Go away!");

/// Close code sent to a second concurrent poll on the same session.
pub const CLOSE_ANOTHER_CONNECTION: (u16, &str) = (2010, "Another connection still open");

/// Close code sent when the connection limit is reached.
pub const CLOSE_CAPACITY: (u16, &str) = (1013, "Connection limit reached");

/// `a[...]` frame carrying `messages`.
pub fn encode_messages(messages: &[String]) -> String {
    format!("a{}", json!(messages))
}

/// `c[code,"reason"]` frame.
pub fn close_frame((code, reason): (u16, &str)) -> String {
    format!("c{}", json!([code, reason]))
}

/// Parse a client payload into STOMP text chunks.
pub fn decode_messages(payload: &str) -> Result<Vec<String>, serde_json::Error> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    if payload.starts_with('[') {
        serde_json::from_str(payload)
    } else {
        serde_json::from_str::<String>(payload).map(|m| vec![m])
    }
}
