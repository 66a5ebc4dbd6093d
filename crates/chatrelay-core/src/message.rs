//! The payload that flows through fan-out.

use std::sync::Arc;

use crate::frame::Frame;

/// An opaque, immutable message bound for a destination.
///
/// The body is reference counted so fan-out to many subscribers shares one
/// allocation. Nothing in the relay inspects or rewrites it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    destination: String,
    content_type: Option<String>,
    body: Arc<str>,
}

impl Message {
    /// Create a message.
    pub fn new(destination: impl Into<String>, body: impl Into<Arc<str>>) -> Self {
        Self {
            destination: destination.into(),
            content_type: None,
            body: body.into(),
        }
    }

    /// Attach a content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Build a message from an inbound `SEND` frame.
    pub fn from_send_frame(destination: &str, frame: &Frame) -> Self {
        Self {
            destination: destination.to_owned(),
            content_type: frame.header("content-type").map(str::to_owned),
            body: Arc::from(frame.body.as_str()),
        }
    }

    /// Same payload addressed to another destination.
    #[must_use]
    pub fn readdressed(&self, destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            content_type: self.content_type.clone(),
            body: Arc::clone(&self.body),
        }
    }

    /// Destination the message is bound for.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Content type, if the sender supplied one.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Message body.
    pub fn body(&self) -> &str {
        &self.body
    }
}
