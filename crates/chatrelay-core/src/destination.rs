//! Destination namespaces.
//!
//! Two prefix families split the destination space: application prefixes
//! (default `/app`) route `SEND` frames to handlers, broadcast prefixes
//! (default `/topic`) name the topics clients may subscribe to.

use crate::errors::{RelayError, Result};

/// Characters that would be pattern syntax in a subscription.
const WILDCARDS: [char; 2] = ['*', '#'];

/// Where a destination string points.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    /// Application destination; holds the path with the prefix stripped
    /// (e.g. `/chat` for `/app/chat`).
    Application(String),
    /// Broadcast topic; holds the full topic name.
    Broadcast(String),
}

/// Prefix configuration shared by the router and the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DestinationPolicy {
    application_prefixes: Vec<String>,
    broadcast_prefixes: Vec<String>,
}

impl DestinationPolicy {
    /// Build a policy. Prefixes are normalized to have no trailing `/`.
    pub fn new<A, B>(application_prefixes: A, broadcast_prefixes: B) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        B: IntoIterator,
        B::Item: Into<String>,
    {
        let normalize = |p: String| p.trim_end_matches('/').to_owned();
        Self {
            application_prefixes: application_prefixes
                .into_iter()
                .map(|p| normalize(p.into()))
                .collect(),
            broadcast_prefixes: broadcast_prefixes
                .into_iter()
                .map(|p| normalize(p.into()))
                .collect(),
        }
    }

    /// Configured application prefixes.
    pub fn application_prefixes(&self) -> &[String] {
        &self.application_prefixes
    }

    /// Configured broadcast prefixes.
    pub fn broadcast_prefixes(&self) -> &[String] {
        &self.broadcast_prefixes
    }

    /// Check that `topic` lives under a broadcast prefix and is well formed.
    pub fn validate_topic<'a>(&self, topic: &'a str) -> Result<&'a str> {
        let rest = self
            .broadcast_prefixes
            .iter()
            .find_map(|prefix| strip_namespace(topic, prefix))
            .ok_or_else(|| {
                RelayError::InvalidTopic(format!(
                    "'{topic}' is outside the broadcast namespace ({})",
                    self.broadcast_prefixes.join(", ")
                ))
            })?;

        if rest.split('/').any(str::is_empty) {
            return Err(RelayError::InvalidTopic(format!(
                "'{topic}' has an empty path segment"
            )));
        }
        if rest
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || WILDCARDS.contains(&c))
        {
            return Err(RelayError::InvalidTopic(format!(
                "'{topic}' contains whitespace, control or wildcard characters"
            )));
        }
        Ok(topic)
    }

    /// Resolve a `SEND` destination.
    pub fn classify(&self, destination: &str) -> Result<Destination> {
        if let Some(path) = self
            .application_prefixes
            .iter()
            .find_map(|prefix| strip_namespace(destination, prefix))
        {
            return Ok(Destination::Application(format!("/{path}")));
        }
        if self
            .broadcast_prefixes
            .iter()
            .any(|prefix| strip_namespace(destination, prefix).is_some())
        {
            return self
                .validate_topic(destination)
                .map(|t| Destination::Broadcast(t.to_owned()));
        }
        Err(RelayError::UnknownDestination(destination.to_owned()))
    }
}

impl Default for DestinationPolicy {
    fn default() -> Self {
        Self::new(["/app"], ["/topic"])
    }
}

/// Strip `prefix/` from `destination`, returning a non-empty remainder.
fn strip_namespace<'a>(destination: &'a str, prefix: &str) -> Option<&'a str> {
    destination
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|rest| !rest.is_empty())
}
