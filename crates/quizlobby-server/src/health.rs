use std::sync::atomic::Ordering;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::state::AppState;

/// Structured health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub connections: ConnectionInfo,
    pub lobbies: LobbyInfo,
}

#[derive(Serialize)]
pub struct ConnectionInfo {
    pub websocket: usize,
    /// Users with a registered delivery channel.
    pub registered: usize,
}

#[derive(Serialize)]
pub struct LobbyInfo {
    pub active: usize,
    pub players: usize,
    /// Lobbies with an operation in flight.
    pub busy: usize,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let (active, players) = state.cache.stats();
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        connections: ConnectionInfo {
            websocket: state.ws_connection_count.load(Ordering::Relaxed),
            registered: state.registry.connected_count(),
        },
        lobbies: LobbyInfo {
            active,
            players,
            busy: state.coordinator.busy_sessions(),
        },
    })
}
