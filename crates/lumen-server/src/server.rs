//! `LumenServer`: axum HTTP + WebSocket server around a [`RealtimeManager`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use lumen_realtime::{ConnectionId, ManagerStats, RealtimeManager, ShutdownCoordinator, TopicId, UserId};
use lumen_settings::ServerSettings;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::health::{self, HealthResponse};
use crate::metrics;
use crate::websocket::session::{SessionOptions, run_ws_session};

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection and broadcast manager.
    pub manager: Arc<RealtimeManager>,
    /// Prometheus handle for `/metrics`.
    pub metrics: PrometheusHandle,
    /// When the server started.
    pub start_time: Instant,
    /// Transport limits applied to each session.
    pub session: SessionOptions,
    /// Largest inbound WebSocket message, in bytes.
    pub max_message_size: usize,
}

/// The Lumen realtime server.
pub struct LumenServer {
    settings: ServerSettings,
    manager: Arc<RealtimeManager>,
    metrics: PrometheusHandle,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl LumenServer {
    /// Create a server. The manager's background tasks are started by the caller.
    pub fn new(
        settings: ServerSettings,
        manager: Arc<RealtimeManager>,
        metrics: PrometheusHandle,
    ) -> Self {
        Self {
            settings,
            manager,
            metrics,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
        }
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            manager: Arc::clone(&self.manager),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
            session: SessionOptions::from(&self.settings),
            max_message_size: self.settings.max_message_size,
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind and serve in a background task until [`shutdown`](Self::shutdown)
    /// is triggered. Returns the bound address and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind((self.settings.host.as_str(), self.settings.port)).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "http server failed");
            }
            info!("http server stopped");
        });
        info!(%addr, "lumen server listening");
        Ok((addr, handle))
    }

    /// The realtime manager.
    pub fn manager(&self) -> &Arc<RealtimeManager> {
        &self.manager
    }

    /// Shutdown coordinator for the HTTP listener.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }
}

/// Query string of `GET /ws`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    /// Authenticated user owning the connection.
    pub user_id: UserId,
    /// Topic to subscribe to on connect.
    pub topic_id: Option<TopicId>,
}

/// GET /ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    if params.user_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "userId must not be empty").into_response();
    }
    if state.manager.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let connection_id = ConnectionId::generate();
    let topic_id = params.topic_id.filter(|t| !t.is_empty());
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| {
            run_ws_session(
                socket,
                connection_id,
                params.user_id,
                topic_id,
                state.manager,
                state.session,
            )
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.manager.connection_count(),
        state.manager.is_shutting_down(),
    ))
}

/// GET /stats
async fn stats_handler(State(state): State<AppState>) -> Json<ManagerStats> {
    Json(state.manager.get_stats())
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    metrics::render(&state.metrics)
}
