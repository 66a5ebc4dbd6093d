//! # chatrelay-core
//!
//! Transport-independent building blocks for the chat relay.
//!
//! - Branded identifiers ([`ConnectionId`], [`MessageId`])
//! - The relay error taxonomy ([`RelayError`])
//! - STOMP 1.0–1.2 frame model and incremental decoder ([`frame`])
//! - Destination namespace policy ([`DestinationPolicy`])
//! - The immutable [`Message`] that flows through fan-out

#![deny(unsafe_code)]

pub mod destination;
pub mod errors;
pub mod frame;
pub mod ids;
pub mod message;

pub use destination::{Destination, DestinationPolicy};
pub use errors::{RelayError, Result};
pub use frame::{Command, Frame, FrameDecoder};
pub use ids::{ConnectionId, MessageId};
pub use message::Message;
