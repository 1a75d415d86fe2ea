use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::json;

use crate::registry::RegistryStats;
use crate::websocket;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub message: &'static str,
    pub status: &'static str,
    pub connections: usize,
    pub sessions: usize,
}

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(status_body(&state.registry.stats()))
}

pub async fn stats(State(state): State<AppState>) -> Json<RegistryStats> {
    Json(state.registry.stats())
}

/// Clients that point at the bare server URL get a socket; anything else
/// gets the status document.
pub async fn root(ws: Option<WebSocketUpgrade>, State(state): State<AppState>) -> Response {
    match ws {
        Some(ws) => websocket::upgrade(ws, state.registry),
        None => Json(status_body(&state.registry.stats())).into_response(),
    }
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn status_body(stats: &RegistryStats) -> StatusResponse {
    StatusResponse {
        message: "StreamShare Signaling Server",
        status: "running",
        connections: stats.connections,
        sessions: stats.sessions,
    }
}
