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
    pub rooms: RoomInfo,
}

#[derive(Serialize)]
pub struct ConnectionInfo {
    pub websocket: usize,
    pub authenticated: usize,
}

#[derive(Serialize)]
pub struct RoomInfo {
    pub active: usize,
    pub participants: usize,
}

/// Structured health check endpoint. Returns server status, connection
/// counts, and room info as JSON.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let ws = state.ws_connection_count.load(Ordering::Relaxed);
    let authenticated = state.registry.read().unwrap().authenticated_count();
    let (active, participants) = state.rooms.stats();

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        connections: ConnectionInfo {
            websocket: ws,
            authenticated,
        },
        rooms: RoomInfo {
            active,
            participants,
        },
    })
}

/// Readiness check — verifies essential subsystems are initialized.
pub async fn readiness_check(State(state): State<AppState>) -> &'static str {
    // Authentication is fail-closed, so a server without a secret can never
    // admit a player.
    if state.auth.session_secret.is_none() {
        return "not ready: no session secret configured";
    }

    "ready"
}
