use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use keysprint_core::net::messages::{ConnectedMsg, ConnectionId, ServerMessage};
use keysprint_core::net::protocol::encode_server_message;

use crate::registry::HeartbeatVerdict;
use crate::router;
use crate::state::{AppState, ConnectionGuard};

pub async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<axum::response::Response, StatusCode> {
    let max_ws = state.config.limits.max_ws_connections;
    let current = state.ws_connection_count.load(Ordering::Relaxed);
    if current >= max_ws {
        tracing::warn!(current, max = max_ws, "WS connection limit reached");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state))
        .into_response())
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let _guard = ConnectionGuard::new(Arc::clone(&state.ws_connection_count));
    let (ws_sender, mut ws_receiver) = socket.split();

    let (tx, rx) = mpsc::channel::<Message>(state.config.limits.connection_buffer);
    let conn_id = state.registry.write().unwrap().register(tx.clone());
    tracing::info!(connection = %conn_id, "Connection opened");

    // Greet with the assigned connection id before anything else.
    let connected = ServerMessage::Connected(ConnectedMsg {
        connection_id: conn_id,
    });
    match encode_server_message(&connected) {
        Ok(text) => {
            if tx.send(Message::Text(text.into())).await.is_err() {
                router::teardown_connection(&state, conn_id);
                return;
            }
        },
        Err(e) => {
            tracing::warn!(connection = %conn_id, error = %e, "Failed to encode greeting");
            router::teardown_connection(&state, conn_id);
            return;
        },
    }

    spawn_writer(ws_sender, rx);

    read_loop(&mut ws_receiver, &state, conn_id).await;

    // Socket gone (close, error, or failed heartbeat) — run the cascade.
    router::teardown_connection(&state, conn_id);
    tracing::info!(connection = %conn_id, "Connection closed");
}

fn spawn_writer(
    mut ws_sender: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let is_close = matches!(frame, Message::Close(_));
            if ws_sender.send(frame).await.is_err() {
                break;
            }
            if is_close {
                break;
            }
        }
    });
}

/// Per-connection rate limiter (token bucket).
struct RateLimiter {
    tokens: f64,
    last_refill: tokio::time::Instant,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
}

impl RateLimiter {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            last_refill: tokio::time::Instant::now(),
            max_tokens,
            refill_rate,
        }
    }

    /// Returns true if the message is allowed; false if rate-limited.
    fn allow(&mut self) -> bool {
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

async fn read_loop(
    ws_receiver: &mut futures::stream::SplitStream<WebSocket>,
    state: &AppState,
    conn_id: ConnectionId,
) {
    let rate = state.config.limits.ws_rate_limit_per_sec;
    let mut rate_limiter = RateLimiter::new(rate, rate);
    let heartbeat = Duration::from_secs(state.config.limits.heartbeat_interval_secs);
    let mut probe = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

    loop {
        tokio::select! {
            inbound = ws_receiver.next() => {
                let Some(Ok(frame)) = inbound else { break };
                match frame {
                    Message::Text(text) => {
                        state.registry.write().unwrap().mark_alive(conn_id);
                        if !rate_limiter.allow() {
                            tracing::warn!(connection = %conn_id, "Rate limited");
                            continue;
                        }
                        router::handle_message(state, conn_id, text.as_str());
                    },
                    // Any frame is proof of life; pongs answer our probes and
                    // client pings are answered at the protocol layer.
                    Message::Pong(_) | Message::Ping(_) => {
                        state.registry.write().unwrap().mark_alive(conn_id);
                    },
                    Message::Close(_) => break,
                    Message::Binary(_) => {
                        // Text protocol only.
                        router::send_error(state, conn_id, "invalid_message");
                    },
                }
            },
            _ = probe.tick() => {
                let verdict = state.registry.write().unwrap().heartbeat_tick(conn_id);
                match verdict {
                    HeartbeatVerdict::Probe => {
                        state
                            .registry
                            .read()
                            .unwrap()
                            .send_to(conn_id, Message::Ping(Vec::new().into()));
                    },
                    HeartbeatVerdict::Dead => {
                        tracing::info!(connection = %conn_id, "Heartbeat timed out");
                        break;
                    },
                    HeartbeatVerdict::Gone => break,
                }
            },
        }
    }
}
