//! StreamShare signaling server.
//!
//! Participants open one WebSocket each, subscribe under an identity, and
//! start or join named sessions. The server keeps the membership directory,
//! announces joins and departures to the other members, and relays
//! offer/answer/candidate messages point-to-point. Media never touches it.

pub mod config;
pub mod handlers;
pub mod registry;
pub mod telemetry;
pub mod websocket;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use registry::{ChannelHandle, RegistryStats, SessionRegistry};

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub metrics: Option<PrometheusHandle>,
}

/// Builds the HTTP + WebSocket router around an existing registry.
pub fn router(registry: SessionRegistry, metrics: Option<PrometheusHandle>) -> Router {
    let state = AppState { registry, metrics };
    Router::new()
        .route("/", get(handlers::root))
        .route("/ws", get(websocket::websocket_handler))
        .route("/health", get(handlers::health_check))
        .route("/status", get(handlers::status))
        .route("/debug/stats", get(handlers::stats))
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
