use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use keysprint_core::net::messages::{AuthenticateMsg, ClientMessage, JoinRoomMsg, ServerMessage};
use keysprint_core::net::protocol::{decode_server_message, encode_client_message};

use keysprint_server::config::{AuthFileConfig, RoomsConfig, ServerConfig};
use keysprint_server::results::RaceOutcome;
use keysprint_server::{build_app, spawn_idle_room_reaper};

pub const SESSION_SECRET: &str = "integration-secret";
pub const API_TOKEN: &str = "integration-bearer";

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub results_rx: mpsc::UnboundedReceiver<RaceOutcome>,
    _serve: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Start a test server with session auth and race timers fast enough
    /// for tests.
    pub async fn new() -> Self {
        Self::from_config(test_config()).await
    }

    pub async fn from_config(config: ServerConfig) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (app, state, results_rx) = build_app(config);
        spawn_idle_room_reaper(state);

        let serve = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Give the server a moment to start accepting
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            addr,
            results_rx,
            _serve: serve,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        auth: AuthFileConfig {
            session_secret: Some(SESSION_SECRET.to_string()),
            bearer_token: Some(API_TOKEN.to_string()),
        },
        rooms: RoomsConfig {
            countdown_from: 2,
            countdown_interval_ms: 40,
            finished_teardown_secs: 1,
            ..RoomsConfig::default()
        },
        ..ServerConfig::default()
    }
}

/// Mint a session token the way the identity provider would.
pub fn make_session_token(user_id: &str, username: &str) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let claims = serde_json::json!({"userId": user_id, "username": username}).to_string();
    let mut mac = <Hmac<Sha256>>::new_from_slice(SESSION_SECRET.as_bytes()).unwrap();
    mac.update(claims.as_bytes());
    format!(
        "{}.{}",
        hex::encode(claims.as_bytes()),
        hex::encode(mac.finalize().into_bytes())
    )
}

/// Connect a WebSocket client to the given URL.
pub async fn ws_connect(url: &str) -> WsStream {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

/// Send a ClientMessage as a text frame.
pub async fn ws_send(stream: &mut WsStream, msg: &ClientMessage) {
    let encoded = encode_client_message(msg).unwrap();
    stream.send(Message::Text(encoded.into())).await.unwrap();
}

/// Read the next ServerMessage from a WebSocket stream (5s timeout).
pub async fn ws_read(stream: &mut WsStream) -> ServerMessage {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return decode_server_message(text.as_str()).unwrap();
                },
                Some(Ok(Message::Close(_))) => panic!("WebSocket closed unexpectedly"),
                Some(Err(e)) => panic!("WebSocket error: {e}"),
                None => panic!("WebSocket stream ended"),
                _ => continue,
            }
        }
    })
    .await
    .expect("Timed out waiting for WebSocket message")
}

/// Try to read the next ServerMessage, returning None on timeout.
pub async fn ws_try_read(stream: &mut WsStream, timeout_ms: u64) -> Option<ServerMessage> {
    let deadline = Duration::from_millis(timeout_ms);
    tokio::time::timeout(deadline, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return decode_server_message(text.as_str()).unwrap();
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    panic!("WebSocket error or closed")
                },
                _ => continue,
            }
        }
    })
    .await
    .ok()
}

/// Read frames until one matches `pred` (5s overall deadline). Lets tests
/// skip over interleaved broadcasts they are not asserting on.
pub async fn ws_read_until<F>(stream: &mut WsStream, mut pred: F) -> ServerMessage
where
    F: FnMut(&ServerMessage) -> bool,
{
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    let msg = decode_server_message(text.as_str()).unwrap();
                    if pred(&msg) {
                        return msg;
                    }
                },
                Some(Ok(Message::Close(_))) => panic!("WebSocket closed unexpectedly"),
                Some(Err(e)) => panic!("WebSocket error: {e}"),
                None => panic!("WebSocket stream ended"),
                _ => continue,
            }
        }
    })
    .await
    .expect("Timed out waiting for matching WebSocket message")
}

/// Connect, consume the `connected` greeting, and authenticate as `user_id`.
pub async fn connect_and_auth(server: &TestServer, user_id: &str) -> WsStream {
    let mut stream = ws_connect(&server.ws_url()).await;
    let greeting = ws_read(&mut stream).await;
    assert!(
        matches!(greeting, ServerMessage::Connected(_)),
        "Expected connected greeting, got {greeting:?}"
    );

    ws_send(
        &mut stream,
        &ClientMessage::Authenticate(AuthenticateMsg {
            token: make_session_token(user_id, user_id),
        }),
    )
    .await;
    let reply = ws_read(&mut stream).await;
    assert!(
        matches!(reply, ServerMessage::Authenticated(_)),
        "Expected authenticated, got {reply:?}"
    );
    stream
}

/// Register a room through the management API.
pub async fn create_room(server: &TestServer, room_id: &str, host_id: &str, max_players: u32) {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/v1/rooms", server.base_url()))
        .bearer_auth(API_TOKEN)
        .json(&serde_json::json!({
            "roomId": room_id,
            "name": format!("{room_id} race"),
            "hostId": host_id,
            "contentId": "passage-1",
            "maxPlayers": max_players,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
}

/// Join a room over an authenticated stream and return the server's answer
/// (`room_joined` or `error`).
pub async fn join_room(stream: &mut WsStream, room_id: &str) -> ServerMessage {
    ws_send(
        stream,
        &ClientMessage::JoinRoom(JoinRoomMsg {
            room_id: room_id.to_string(),
            user_id: None,
            username: None,
        }),
    )
    .await;
    ws_read_until(stream, |m| {
        matches!(m, ServerMessage::RoomJoined(_) | ServerMessage::Error(_))
    })
    .await
}
