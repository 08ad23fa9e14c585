use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::room::{ParticipantSnapshot, RoomId, RoomSnapshot, UserId};

/// Server-assigned identifier for one WebSocket connection. Reported to the
/// client in `connected` and never reused.
pub type ConnectionId = Uuid;

// Client -> Server payloads

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateMsg {
    pub token: String,
}

/// Join request. The user id is carried for wire compatibility but the
/// identity bound by `authenticate` is authoritative; a non-empty username
/// overrides the token display name for this room only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomMsg {
    pub room_id: RoomId,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingProgressMsg {
    pub progress: f32,
    pub wpm: f32,
    pub accuracy: f32,
    pub errors: u32,
}

// Server -> Client payloads

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedMsg {
    pub connection_id: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedMsg {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoinedMsg {
    pub room_id: RoomId,
    pub room: RoomSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomLeftMsg {
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUpdatedMsg {
    pub room: RoomSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantJoinedMsg {
    pub participant: ParticipantSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantLeftMsg {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceCountdownMsg {
    pub room_id: RoomId,
    pub countdown: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceStartedMsg {
    pub room_id: RoomId,
    pub start_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantFinishedMsg {
    pub user_id: UserId,
    pub finished_at: i64,
    pub wpm: f32,
    pub accuracy: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceFinishedMsg {
    pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMsg {
    pub error: String,
}

/// Messages a client may send. Closed set; anything else is rejected at the
/// decode boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Ping,
    Authenticate(AuthenticateMsg),
    JoinRoom(JoinRoomMsg),
    LeaveRoom,
    StartRace,
    TypingProgress(TypingProgressMsg),
}

impl ClientMessage {
    /// Wire `kind` string for this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Ping => "ping",
            ClientMessage::Authenticate(_) => "authenticate",
            ClientMessage::JoinRoom(_) => "join_room",
            ClientMessage::LeaveRoom => "leave_room",
            ClientMessage::StartRace => "start_race",
            ClientMessage::TypingProgress(_) => "typing_progress",
        }
    }
}

/// Messages the server may send, directed or broadcast.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Connected(ConnectedMsg),
    Pong,
    Authenticated(AuthenticatedMsg),
    RoomJoined(RoomJoinedMsg),
    RoomLeft(RoomLeftMsg),
    RoomUpdated(RoomUpdatedMsg),
    ParticipantJoined(ParticipantJoinedMsg),
    ParticipantLeft(ParticipantLeftMsg),
    RaceCountdown(RaceCountdownMsg),
    RaceStarted(RaceStartedMsg),
    ParticipantFinished(ParticipantFinishedMsg),
    RaceFinished(RaceFinishedMsg),
    Error(ErrorMsg),
}

impl ServerMessage {
    /// Wire `kind` string for this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connected(_) => "connected",
            ServerMessage::Pong => "pong",
            ServerMessage::Authenticated(_) => "authenticated",
            ServerMessage::RoomJoined(_) => "room_joined",
            ServerMessage::RoomLeft(_) => "room_left",
            ServerMessage::RoomUpdated(_) => "room_updated",
            ServerMessage::ParticipantJoined(_) => "participant_joined",
            ServerMessage::ParticipantLeft(_) => "participant_left",
            ServerMessage::RaceCountdown(_) => "race_countdown",
            ServerMessage::RaceStarted(_) => "race_started",
            ServerMessage::ParticipantFinished(_) => "participant_finished",
            ServerMessage::RaceFinished(_) => "race_finished",
            ServerMessage::Error(_) => "error",
        }
    }

    /// Shorthand for a directed error reply.
    pub fn error(reason: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorMsg {
            error: reason.into(),
        })
    }
}
