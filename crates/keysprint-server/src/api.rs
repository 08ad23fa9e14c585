use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};

use keysprint_core::room::{MIN_PLAYERS_TO_START, ParticipantSnapshot, RoomSnapshot};

use crate::error::AppError;
use crate::room_coordinator::{NewRoom, RoomError};
use crate::state::AppState;

/// Request body for registering a room.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomBody {
    pub room_id: String,
    pub name: String,
    pub host_id: String,
    pub content_id: String,
    #[serde(default = "default_max_players")]
    pub max_players: u32,
}

fn default_max_players() -> u32 {
    4
}

/// Validate room field shapes to prevent abuse.
fn validate_room_fields(body: &CreateRoomBody) -> Result<(), AppError> {
    if body.room_id.is_empty() || body.room_id.len() > 64 {
        return Err(AppError::BadRequest(
            "roomId must be 1-64 chars".to_string(),
        ));
    }
    if !body
        .room_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(AppError::BadRequest(
            "roomId must be alphanumeric with - or _".to_string(),
        ));
    }
    if body.name.is_empty() || body.name.len() > 128 {
        return Err(AppError::BadRequest("name must be 1-128 chars".to_string()));
    }
    if body.host_id.is_empty() || body.host_id.len() > 128 {
        return Err(AppError::BadRequest(
            "hostId must be 1-128 chars".to_string(),
        ));
    }
    if body.content_id.is_empty() || body.content_id.len() > 128 {
        return Err(AppError::BadRequest(
            "contentId must be 1-128 chars".to_string(),
        ));
    }
    if (body.max_players as usize) < MIN_PLAYERS_TO_START {
        return Err(AppError::BadRequest(format!(
            "maxPlayers must be at least {MIN_PLAYERS_TO_START}"
        )));
    }
    if body.max_players > 50 {
        return Err(AppError::BadRequest("maxPlayers exceeds 50".to_string()));
    }
    Ok(())
}

/// POST /api/v1/rooms — register a room from the catalog.
pub async fn create_room(
    State(state): State<AppState>,
    Json(body): Json<CreateRoomBody>,
) -> Result<(StatusCode, Json<RoomSnapshot>), AppError> {
    validate_room_fields(&body)?;
    let room_id = body.room_id.clone();
    match state.rooms.create_room(NewRoom {
        id: body.room_id,
        name: body.name,
        host_id: body.host_id,
        content_id: body.content_id,
        max_players: body.max_players,
    }) {
        Ok(snapshot) => Ok((StatusCode::CREATED, Json(snapshot))),
        Err(RoomError::AlreadyExists) => {
            Err(AppError::Conflict(format!("Room {room_id} already exists")))
        },
        Err(e) => Err(AppError::BadRequest(e.to_string())),
    }
}

/// GET /api/v1/rooms/:room_id — current room snapshot.
pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomSnapshot>, AppError> {
    state
        .rooms
        .snapshot(&room_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Room {room_id} not found")))
}

/// GET /api/v1/rooms/:room_id/participants — live participant list.
pub async fn get_room_participants(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<Vec<ParticipantSnapshot>>, AppError> {
    state
        .rooms
        .participants(&room_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Room {room_id} not found")))
}

/// Live counters for dashboards.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub connection_count: usize,
    pub authenticated_user_count: usize,
    pub room_count: usize,
}

/// GET /api/v1/stats — connection and room counters.
pub async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let (connection_count, authenticated_user_count) = {
        let registry = state.registry.read().unwrap();
        (registry.connection_count(), registry.authenticated_count())
    };
    Json(StatsResponse {
        connection_count,
        authenticated_user_count,
        room_count: state.rooms.room_count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::config::ServerConfig;
    use keysprint_core::room::RoomStatus;

    fn make_state() -> AppState {
        let (state, _results_rx) = AppState::new(ServerConfig::default());
        state
    }

    fn make_body(room_id: &str) -> CreateRoomBody {
        CreateRoomBody {
            room_id: room_id.to_string(),
            name: "Morning sprint".to_string(),
            host_id: "host-1".to_string(),
            content_id: "passage-9".to_string(),
            max_players: 4,
        }
    }

    #[tokio::test]
    async fn create_room_returns_snapshot() {
        let state = make_state();
        let result = create_room(State(state.clone()), Json(make_body("room-1"))).await;
        let (status, json) = result.unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json.id, "room-1");
        assert_eq!(json.status, RoomStatus::Waiting);
        assert!(json.participants.is_empty());
        assert!(state.rooms.snapshot("room-1").is_some());
    }

    #[tokio::test]
    async fn create_duplicate_room_conflicts() {
        let state = make_state();
        let _ = create_room(State(state.clone()), Json(make_body("room-1")))
            .await
            .unwrap();
        let result = create_room(State(state), Json(make_body("room-1"))).await;
        assert!(matches!(result.unwrap_err(), AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn create_room_rejects_small_capacity() {
        let state = make_state();
        let mut body = make_body("room-1");
        body.max_players = 1;
        let result = create_room(State(state), Json(body)).await;
        assert!(
            matches!(result.unwrap_err(), AppError::BadRequest(msg) if msg.contains("maxPlayers"))
        );
    }

    #[tokio::test]
    async fn create_room_rejects_bad_id() {
        let state = make_state();
        let mut body = make_body("room-1");
        body.room_id = "room one!".to_string();
        let result = create_room(State(state), Json(body)).await;
        assert!(matches!(result.unwrap_err(), AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn get_missing_room_is_not_found() {
        let state = make_state();
        let result = get_room(State(state), Path("nope".to_string())).await;
        assert!(matches!(result.unwrap_err(), AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn get_room_roundtrip() {
        let state = make_state();
        let _ = create_room(State(state.clone()), Json(make_body("room-1")))
            .await
            .unwrap();
        let json = get_room(State(state), Path("room-1".to_string()))
            .await
            .unwrap();
        assert_eq!(json.name, "Morning sprint");
        assert_eq!(json.max_players, 4);
    }

    #[tokio::test]
    async fn participants_endpoint_reflects_room() {
        let state = make_state();
        let _ = create_room(State(state.clone()), Json(make_body("room-1")))
            .await
            .unwrap();
        let json = get_room_participants(State(state), Path("room-1".to_string()))
            .await
            .unwrap();
        assert!(json.is_empty());
    }

    #[tokio::test]
    async fn stats_reports_counters() {
        let state = make_state();
        let _ = create_room(State(state.clone()), Json(make_body("room-1")))
            .await
            .unwrap();
        {
            let mut registry = state.registry.write().unwrap();
            let (tx, _rx) = tokio::sync::mpsc::channel(8);
            let conn = registry.register(tx);
            registry
                .bind(
                    conn,
                    Identity {
                        user_id: "u1".to_string(),
                        username: "u1".to_string(),
                    },
                )
                .unwrap();
        }

        let json = get_stats(State(state)).await;
        assert_eq!(json.connection_count, 1);
        assert_eq!(json.authenticated_user_count, 1);
        assert_eq!(json.room_count, 1);
    }
}
