//! # chatrelay-server
//!
//! Axum HTTP + `WebSocket` server for the STOMP chat relay.
//!
//! - Connection registry and topic router with snapshot fan-out ([`broker`])
//! - STOMP session state machine and application routes ([`relay`])
//! - `WebSocket` transport with ping/pong liveness ([`websocket`])
//! - SockJS fallback: framed `WebSocket` and XHR polling ([`sockjs`])
//! - Health, Prometheus metrics and graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod broker;
pub mod config;
pub mod health;
pub mod metrics;
pub mod relay;
pub mod server;
pub mod shutdown;
pub mod sockjs;
pub mod websocket;

pub use config::ServerConfig;
pub use relay::{EchoHandler, MessageHandler, Relay, RouteTable};
pub use server::RelayServer;
