pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod health;
pub mod registry;
pub mod results;
pub mod room_coordinator;
pub mod router;
pub mod state;
pub mod ws;

use std::time::Duration;

use axum::Router;
use axum::middleware;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use config::ServerConfig;
use results::RaceOutcome;
use state::AppState;

/// Build the Axum router and application state from a config. The returned
/// receiver carries finished-race outcomes for a results consumer.
pub fn build_app(
    config: ServerConfig,
) -> (Router<()>, AppState, mpsc::UnboundedReceiver<RaceOutcome>) {
    let (state, results_rx) = AppState::new(config);

    // Management routes (behind bearer auth middleware)
    let api_routes = Router::new()
        .route("/rooms", axum::routing::post(api::create_room))
        .route("/rooms/{room_id}", axum::routing::get(api::get_room))
        .route(
            "/rooms/{room_id}/participants",
            axum::routing::get(api::get_room_participants),
        )
        .route("/stats", axum::routing::get(api::get_stats))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            bearer_auth_layer,
        ));

    let app = Router::new()
        .route("/ws", axum::routing::get(ws::ws_handler))
        .route("/healthz", axum::routing::get(health::health_check))
        .route("/readyz", axum::routing::get(health::readiness_check))
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    (app, state, results_rx)
}

/// Background task that periodically destroys rooms with no recent activity.
pub fn spawn_idle_room_reaper(state: AppState) {
    tokio::spawn(async move {
        let idle_after = Duration::from_secs(state.config.rooms.idle_timeout_secs);
        let period = Duration::from_secs(state.config.rooms.idle_check_interval_secs);
        loop {
            tokio::time::sleep(period).await;
            let removed = state.rooms.cleanup_idle_rooms(idle_after);
            if removed > 0 {
                tracing::info!(removed, "Idle rooms cleaned up");
            }
        }
    });
}

/// Middleware wrapper that injects AuthConfig into request extensions for the
/// bearer auth middleware.
async fn bearer_auth_layer(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut request: axum::extract::Request,
    next: middleware::Next,
) -> Result<axum::response::Response, axum::http::StatusCode> {
    request.extensions_mut().insert(state.auth.clone());
    auth::bearer_auth_middleware(request.headers().clone(), request, next).await
}
