use serde::{Deserialize, Serialize};

/// User identifier as issued by the identity provider.
pub type UserId = String;

/// Room identifier as issued by the room catalog.
pub type RoomId = String;

/// Minimum number of participants required to start a race. Also the
/// smallest capacity a room may be created with.
pub const MIN_PLAYERS_TO_START: usize = 2;

/// Lifecycle status of a room. Strictly monotonic: a room only ever moves
/// forward through `Waiting -> Countdown -> Active -> Finished` and no
/// status is re-enterable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Waiting,
    Countdown,
    Active,
    Finished,
}

impl RoomStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: RoomStatus) -> bool {
        matches!(
            (self, next),
            (RoomStatus::Waiting, RoomStatus::Countdown)
                | (RoomStatus::Countdown, RoomStatus::Active)
                | (RoomStatus::Active, RoomStatus::Finished)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoomStatus::Waiting => "waiting",
            RoomStatus::Countdown => "countdown",
            RoomStatus::Active => "active",
            RoomStatus::Finished => "finished",
        }
    }
}

impl std::fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire-facing view of one participant, embedded in room snapshots and
/// returned by the management API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSnapshot {
    pub user_id: UserId,
    pub username: String,
    pub progress: f32,
    pub wpm: f32,
    pub accuracy: f32,
    pub errors: u32,
    pub finished: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
}

/// Wire-facing view of a whole room: identity, status, and the full
/// participant list. Sent on joins and on every progress change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub id: RoomId,
    pub name: String,
    pub status: RoomStatus,
    pub host_id: UserId,
    pub content_id: String,
    pub max_players: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    pub participants: Vec<ParticipantSnapshot>,
}
