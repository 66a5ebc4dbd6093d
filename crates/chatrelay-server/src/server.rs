//! `RelayServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use chatrelay_core::Result;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::relay::{Relay, RouteTable};
use crate::shutdown::ShutdownCoordinator;
use crate::sockjs::{self, PollingSessions};
use crate::websocket::{TransportOptions, run_ws_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Relay the transports open sessions on.
    pub relay: Arc<Relay>,
    /// XHR polling sessions.
    pub polling: Arc<PollingSessions>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The relay server.
pub struct RelayServer {
    config: Arc<ServerConfig>,
    relay: Arc<Relay>,
    polling: Arc<PollingSessions>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl RelayServer {
    /// Create a new server. Fails if a route broadcasts outside the
    /// configured topic namespace.
    pub fn new(config: ServerConfig, routes: RouteTable) -> Result<Self> {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let relay = Arc::new(Relay::new(&config, routes, shutdown.token())?);
        let polling = Arc::new(PollingSessions::new(
            Arc::clone(&relay),
            config.sockjs_heartbeat_interval(),
            config.sockjs_disconnect_delay(),
        ));
        Ok(Self {
            config: Arc::new(config),
            relay,
            polling,
            shutdown,
            metrics: None,
            start_time: Instant::now(),
        })
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            relay: Arc::clone(&self.relay),
            polling: Arc::clone(&self.polling),
            config: Arc::clone(&self.config),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        let endpoint = self.config.endpoint.as_str();
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route(endpoint, get(ws_handler));

        if self.config.sockjs_enabled {
            router = router
                .route(&format!("{endpoint}/info"), get(sockjs::info_handler))
                .route(
                    &format!("{endpoint}/{{server_id}}/{{session_id}}/websocket"),
                    get(sockjs::websocket_handler),
                )
                .route(
                    &format!("{endpoint}/{{server_id}}/{{session_id}}/xhr"),
                    post(sockjs::xhr_handler),
                )
                .route(
                    &format!("{endpoint}/{{server_id}}/{{session_id}}/xhr_send"),
                    post(sockjs::xhr_send_handler),
                );
        }

        router
            .with_state(state)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and serve in a background task.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task.
    /// The task ends once [`ShutdownCoordinator::shutdown`] is called.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();
        let relay = Arc::clone(&self.relay);

        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                token.cancelled().await;
                let _ = relay.close_all();
            });
            if let Err(err) = serve.await {
                error!(error = %err, "server error");
            }
        });

        info!(%addr, endpoint = %self.config.endpoint, sockjs = self.config.sockjs_enabled, "relay listening");
        Ok((addr, handle))
    }

    /// Get the relay.
    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.relay.registry().count();
    let topics = state.relay.router().topic_count();
    Json(health::health_check(state.start_time, connections, topics))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET {endpoint}: STOMP over WebSocket.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let relay = Arc::clone(&state.relay);
    let options = TransportOptions::stomp(&state.config);
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, relay, options))
}
