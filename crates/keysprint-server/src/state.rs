use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use crate::auth::AuthConfig;
use crate::config::ServerConfig;
use crate::registry::ConnectionRegistry;
use crate::results::{RaceOutcome, results_channel};
use crate::room_coordinator::{RaceTimings, RoomCoordinator};

pub type SharedRegistry = Arc<RwLock<ConnectionRegistry>>;

#[derive(Clone)]
pub struct AppState {
    pub registry: SharedRegistry,
    pub rooms: RoomCoordinator,
    pub auth: AuthConfig,
    pub config: Arc<ServerConfig>,
    pub ws_connection_count: Arc<AtomicUsize>,
}

impl AppState {
    /// Builds the shared state plus the receiving end of the race-outcome
    /// channel, which the caller hands to a results consumer.
    pub fn new(config: ServerConfig) -> (Self, mpsc::UnboundedReceiver<RaceOutcome>) {
        let auth = AuthConfig {
            session_secret: config.auth.session_secret.clone(),
            bearer_token: config.auth.bearer_token.clone(),
        };
        let registry: SharedRegistry = Arc::new(RwLock::new(ConnectionRegistry::new()));
        let (results_tx, results_rx) = results_channel();
        let rooms = RoomCoordinator::new(
            Arc::clone(&registry),
            results_tx,
            RaceTimings::from_config(&config.rooms),
        );
        let state = Self {
            registry,
            rooms,
            auth,
            config: Arc::new(config),
            ws_connection_count: Arc::new(AtomicUsize::new(0)),
        };
        (state, results_rx)
    }
}

/// Counts a live WebSocket connection for the duration of its socket task.
pub struct ConnectionGuard {
    count: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    pub fn new(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::Relaxed);
        Self { count }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }
}
