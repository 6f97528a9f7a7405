//! HTTP server for health checks, metrics and signaling
//!
//! Serves the signaling WebSocket, the diagnostic endpoints and, when
//! configured, a static web root.

use crate::web::shared::SharedState;
use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use log::{error, info};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::services::{ServeDir, ServeFile};

/// Alias kept for clients that connect to the generic socket path
const SOCKET_ALIAS: &str = "/socket";

/// Build the application router
pub fn build_router(state: Arc<SharedState>) -> Router {
    let signaling_path = state.config.signaling.path.clone();
    info!("Signaling endpoint at {}", signaling_path);

    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ice-servers", get(ice_servers_handler))
        .route(&signaling_path, get(signaling_handler));
    if signaling_path != SOCKET_ALIAS {
        app = app.route(SOCKET_ALIAS, get(signaling_handler));
    }

    let app = match &state.config.http.static_root {
        Some(root) => {
            info!("Serving static files from {:?}", root);
            let static_service = ServeDir::new(root).fallback(ServeFile::new(root.join("index.html")));
            app.fallback_service(static_service)
        }
        None => app,
    };

    app.with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn run_http_server<F>(
    listener: TcpListener,
    state: Arc<SharedState>,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    let app = build_router(state);
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;

    info!("HTTP server stopped");
    Ok(())
}

async fn signaling_handler(ws: WebSocketUpgrade, State(state): State<Arc<SharedState>>) -> Response {
    ws.on_upgrade(move |socket| crate::transport::handle_signaling_connection(socket, state))
}

/// Health check handler
async fn health_handler(State(state): State<Arc<SharedState>>) -> Json<serde_json::Value> {
    let status = state.matchmaker.status();
    Json(json!({
        "status": "healthy",
        "online": status.online,
        "waiting": status.waiting,
        "active_pairs": status.active_pairs,
        "oldest_wait_seconds": status.oldest_wait.map(|d| d.as_secs_f64()),
        "uptime_seconds": state.uptime().as_secs_f64(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Metrics handler (Prometheus format)
async fn metrics_handler(State(state): State<Arc<SharedState>>) -> Response {
    state.observe();
    match state.matchmaker.metrics().render() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// STUN/TURN configuration for participants
async fn ice_servers_handler(State(state): State<Arc<SharedState>>) -> Json<serde_json::Value> {
    Json(json!({
        "iceServers": state.config.ice.servers,
    }))
}
