//! Application routes: handler lookup and async dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chatrelay_core::{DestinationPolicy, Message, RelayError, Result};
use metrics::{counter, histogram};
use tracing::{error, warn};

use crate::metrics::{HANDLER_DURATION_SECONDS, HANDLER_INVOCATIONS_TOTAL};

/// Handles messages sent to one application destination.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process an inbound message. `Some` is broadcast to the route's
    /// topic; `None` publishes nothing.
    async fn handle(&self, message: Message) -> Result<Option<Message>>;
}

/// Returns every message unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle(&self, message: Message) -> Result<Option<Message>> {
        Ok(Some(message))
    }
}

struct Route {
    handler: Arc<dyn MessageHandler>,
    send_to: String,
}

/// Maps application paths (prefix stripped, e.g. `/chat`) to handlers and
/// the topic each handler's output is broadcast to.
pub struct RouteTable {
    routes: HashMap<String, Route>,
}

impl RouteTable {
    /// Maximum time a single handler is allowed to run.
    const HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    /// The chat room: `/chat` echoed to `/topic/messages`.
    pub fn chat() -> Self {
        let mut table = Self::new();
        table.register("/chat", "/topic/messages", EchoHandler);
        table
    }

    /// Register a handler for `path`, broadcasting its output to `send_to`.
    pub fn register(&mut self, path: &str, send_to: &str, handler: impl MessageHandler + 'static) {
        let _ = self.routes.insert(
            path.to_owned(),
            Route {
                handler: Arc::new(handler),
                send_to: send_to.to_owned(),
            },
        );
    }

    /// Check every route's topic against the broadcast namespace.
    pub fn validate(&self, policy: &DestinationPolicy) -> Result<()> {
        for (path, route) in &self.routes {
            if !path.starts_with('/') {
                return Err(RelayError::UnknownDestination(format!(
                    "route path '{path}' must start with '/'"
                )));
            }
            let _ = policy.validate_topic(&route.send_to)?;
        }
        Ok(())
    }

    /// Topic a route broadcasts to.
    pub fn send_to(&self, path: &str) -> Option<&str> {
        self.routes.get(path).map(|r| r.send_to.as_str())
    }

    /// Run the handler for `path`. Its output is re-addressed to the route's
    /// topic. A handler that overruns its time budget publishes nothing.
    pub async fn dispatch(&self, path: &str, message: Message) -> Result<Option<Message>> {
        let Some(route) = self.routes.get(path) else {
            return Err(RelayError::UnknownDestination(path.to_owned()));
        };
        counter!(HANDLER_INVOCATIONS_TOTAL, "route" => path.to_owned()).increment(1);

        let start = Instant::now();
        let result =
            tokio::time::timeout(Self::HANDLER_TIMEOUT, route.handler.handle(message)).await;
        let duration = start.elapsed();
        histogram!(HANDLER_DURATION_SECONDS, "route" => path.to_owned())
            .record(duration.as_secs_f64());
        if duration.as_secs() >= 5 {
            warn!(route = path, duration_secs = duration.as_secs_f64(), "slow handler");
        }

        match result {
            Ok(Ok(output)) => Ok(output.map(|m| m.readdressed(route.send_to.as_str()))),
            Ok(Err(err)) => Err(err),
            Err(_elapsed) => {
                error!(route = path, "handler timed out after {:?}", Self::HANDLER_TIMEOUT);
                Ok(None)
            }
        }
    }

    /// List all registered paths (sorted).
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.routes.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Check whether a path is registered.
    pub fn has_route(&self, path: &str) -> bool {
        self.routes.contains_key(path)
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("paths", &self.paths())
            .finish()
    }
}
