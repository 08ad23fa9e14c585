use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use keysprint_core::room::{RoomId, UserId};

/// Final metrics for one participant, as handed to result persistence.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantResult {
    pub user_id: UserId,
    pub username: String,
    pub progress: f32,
    pub wpm: f32,
    pub accuracy: f32,
    pub errors: u32,
    pub finished: bool,
    pub finished_at: Option<i64>,
}

/// Everything result persistence needs about a completed race. Emitted once
/// per room, when it reaches `finished`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceOutcome {
    pub room_id: RoomId,
    pub name: String,
    pub content_id: String,
    pub started_at: Option<i64>,
    pub finished_at: i64,
    pub results: Vec<ParticipantResult>,
}

/// Fire-and-forget hand-off channel into result persistence. Unbounded so a
/// slow consumer can never stall a room; a send failure is the consumer's
/// problem, never the room's.
pub type ResultsTx = mpsc::UnboundedSender<RaceOutcome>;

pub fn results_channel() -> (ResultsTx, mpsc::UnboundedReceiver<RaceOutcome>) {
    mpsc::unbounded_channel()
}

/// Background consumer that records each race outcome to the structured log.
/// Stands in for the external persistence collaborator; a real deployment
/// replaces this task with one that forwards to storage.
pub fn spawn_result_logger(mut rx: mpsc::UnboundedReceiver<RaceOutcome>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(outcome) = rx.recv().await {
            match serde_json::to_string(&outcome) {
                Ok(json) => {
                    tracing::info!(
                        room = %outcome.room_id,
                        participants = outcome.results.len(),
                        outcome = %json,
                        "Race outcome recorded"
                    );
                },
                Err(e) => {
                    tracing::warn!(room = %outcome.room_id, error = %e, "Failed to encode race outcome");
                },
            }
        }
        tracing::info!("Result channel closed, stopping result logger");
    })
}
