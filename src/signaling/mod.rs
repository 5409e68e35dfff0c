#![forbid(unsafe_code)]

// Signaling module - websocket signaling server

pub mod protocol;

use crate::config::Config;
use crate::metrics::ServerMetrics;
use crate::sfu::peer_session;
use crate::sfu::room::RoomStore;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{info, warn};

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    store: RoomStore,
    config: Arc<Config>,
    metrics: ServerMetrics,
}

impl SignalingServer {
    pub fn new(store: RoomStore, config: Arc<Config>, metrics: ServerMetrics) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
            .fallback_service(ServeDir::new("static"))
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": server.store.room_count(),
        "peers": server.store.peer_count(),
    }))
}

/// Metrics handler — Prometheus text exposition format.
async fn metrics_handler(State(server): State<SignalingServer>) -> Response {
    let body = server
        .metrics
        .render_prometheus(server.store.room_count(), server.store.peer_count());
    (
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler. The origin allow-list is enforced here, before
/// the join request is ever read.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<SignalingServer>,
    headers: HeaderMap,
) -> Response {
    let origin = headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    if !server.config.allows_origin(origin.as_deref()) {
        warn!("websocket origin rejected: {:?}", origin);
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("websocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            peer_session::run_session(
                socket,
                origin,
                server.store,
                server.config,
                server.metrics,
            )
        })
}
