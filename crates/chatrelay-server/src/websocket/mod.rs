//! WebSocket transport: per-client connection state and socket lifecycle.

pub mod connection;
pub mod session;

pub use connection::ClientConnection;
pub use session::{Framing, TransportOptions, run_ws_session};
