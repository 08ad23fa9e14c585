use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use axum::extract::ws::Message;

use keysprint_core::net::messages::{
    ConnectionId, ParticipantFinishedMsg, ParticipantJoinedMsg, ParticipantLeftMsg,
    RaceCountdownMsg, RaceFinishedMsg, RaceStartedMsg, RoomLeftMsg, RoomUpdatedMsg, ServerMessage,
    TypingProgressMsg,
};
use keysprint_core::net::protocol::encode_server_message;
use keysprint_core::room::{
    MIN_PLAYERS_TO_START, ParticipantSnapshot, RoomId, RoomSnapshot, RoomStatus, UserId,
};
use keysprint_core::time::timestamp_ms;

use crate::auth::Identity;
use crate::config::RoomsConfig;
use crate::registry::OutboundSender;
use crate::results::{ParticipantResult, RaceOutcome, ResultsTx};
use crate::state::SharedRegistry;

/// Race pacing knobs, derived from `RoomsConfig` at startup.
#[derive(Debug, Clone, Copy)]
pub struct RaceTimings {
    pub countdown_from: u32,
    pub countdown_interval: Duration,
    pub finished_teardown: Duration,
}

impl RaceTimings {
    pub fn from_config(cfg: &RoomsConfig) -> Self {
        Self {
            countdown_from: cfg.countdown_from,
            countdown_interval: Duration::from_millis(cfg.countdown_interval_ms),
            finished_teardown: Duration::from_secs(cfg.finished_teardown_secs),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RoomError {
    NotFound,
    AlreadyExists,
    CapacityTooSmall(u32),
    Full,
    NotJoinable,
    AlreadyJoined,
    NotParticipant,
    NotHost,
    NotEnoughPlayers,
    AlreadyStarted,
    NotActive,
    ConnectionGone,
}

impl RoomError {
    /// Machine-readable reason carried in directed `error` replies.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::NotFound => "room_not_found",
            Self::AlreadyExists => "room_already_exists",
            Self::CapacityTooSmall(_) => "invalid_capacity",
            Self::Full => "room_full",
            Self::NotJoinable => "room_not_joinable",
            Self::AlreadyJoined => "already_joined",
            Self::NotParticipant => "not_in_room",
            Self::NotHost | Self::NotEnoughPlayers | Self::AlreadyStarted => "cannot_start",
            Self::NotActive => "race_not_active",
            Self::ConnectionGone => "not_authenticated",
        }
    }
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "room not found"),
            Self::AlreadyExists => write!(f, "room already exists"),
            Self::CapacityTooSmall(n) => {
                write!(f, "max_players must be at least {MIN_PLAYERS_TO_START}, got {n}")
            },
            Self::Full => write!(f, "room is full"),
            Self::NotJoinable => write!(f, "room is not accepting joins"),
            Self::AlreadyJoined => write!(f, "already a participant of this room"),
            Self::NotParticipant => write!(f, "not a participant of this room"),
            Self::NotHost => write!(f, "only the host can start the race"),
            Self::NotEnoughPlayers => {
                write!(f, "need at least {MIN_PLAYERS_TO_START} participants to start")
            },
            Self::AlreadyStarted => write!(f, "race already started"),
            Self::NotActive => write!(f, "race is not active"),
            Self::ConnectionGone => write!(f, "connection is no longer bound to this user"),
        }
    }
}

impl std::error::Error for RoomError {}

/// Why a participant is being removed; log detail only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    Left,
    Disconnected,
}

/// Why a room is being destroyed; carried as the `room_left` reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DestroyReason {
    Empty,
    HostLeft,
    RaceComplete,
    Idle,
}

impl DestroyReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::HostLeft => "host_left",
            Self::RaceComplete => "room_closed",
            Self::Idle => "idle_timeout",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Participant removed, room still alive.
    Left,
    /// Removing this participant destroyed the room.
    Destroyed,
    NotFound,
    NotParticipant,
}

/// Room metadata as supplied by the room catalog.
#[derive(Debug, Clone)]
pub struct NewRoom {
    pub id: RoomId,
    pub name: String,
    pub host_id: UserId,
    pub content_id: String,
    pub max_players: u32,
}

struct Participant {
    user_id: UserId,
    username: String,
    connection_id: ConnectionId,
    sender: OutboundSender,
    progress: f32,
    wpm: f32,
    accuracy: f32,
    errors: u32,
    finished: bool,
    finished_at: Option<i64>,
    last_update: i64,
}

impl Participant {
    fn snapshot(&self) -> ParticipantSnapshot {
        ParticipantSnapshot {
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            progress: self.progress,
            wpm: self.wpm,
            accuracy: self.accuracy,
            errors: self.errors,
            finished: self.finished,
            finished_at: self.finished_at,
        }
    }

    fn result(&self) -> ParticipantResult {
        ParticipantResult {
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            progress: self.progress,
            wpm: self.wpm,
            accuracy: self.accuracy,
            errors: self.errors,
            finished: self.finished,
            finished_at: self.finished_at,
        }
    }
}

/// One race room. Each room is its own lock domain so distinct rooms
/// mutate fully in parallel.
struct Room {
    id: RoomId,
    name: String,
    host_id: UserId,
    content_id: String,
    max_players: u32,
    status: RoomStatus,
    created_at: i64,
    countdown_started_at: Option<i64>,
    started_at: Option<i64>,
    participants: HashMap<UserId, Participant>,
    last_activity: Instant,
    /// Set under the room lock by whichever path decided to destroy the
    /// room; later operations on a still-reachable handle see it and bail.
    closing: bool,
}

impl Room {
    fn snapshot(&self) -> RoomSnapshot {
        let mut participants: Vec<ParticipantSnapshot> =
            self.participants.values().map(Participant::snapshot).collect();
        // Stable order for clients and tests.
        participants.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        RoomSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            host_id: self.host_id.clone(),
            content_id: self.content_id.clone(),
            max_players: self.max_players,
            started_at: self.started_at,
            participants,
        }
    }

    /// Serialize once, then fan out to every participant's channel. Slow or
    /// closed targets are skipped; the registry teardown path reconciles them.
    fn broadcast(&self, msg: &ServerMessage) {
        match encode_server_message(msg) {
            Ok(text) => {
                let frame = Message::Text(text.into());
                for (user_id, p) in &self.participants {
                    if let Err(e) = p.sender.try_send(frame.clone()) {
                        tracing::debug!(
                            user = %user_id, room = %self.id, error = %e,
                            "Skipping broadcast to slow client"
                        );
                    }
                }
            },
            Err(e) => {
                tracing::warn!(
                    room = %self.id, kind = msg.kind(), error = %e,
                    "Failed to encode broadcast"
                );
            },
        }
    }

    fn all_finished(&self) -> bool {
        !self.participants.is_empty() && self.participants.values().all(|p| p.finished)
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Owns every room and drives the race state machine. Cheap to clone; all
/// clones share the same room map. The registry handle is used to keep
/// connection room-bindings in step with membership (lock order is always
/// room map -> room -> registry, never the reverse).
#[derive(Clone)]
pub struct RoomCoordinator {
    rooms: Arc<RwLock<HashMap<RoomId, Arc<Mutex<Room>>>>>,
    registry: SharedRegistry,
    results: ResultsTx,
    timings: RaceTimings,
}

impl RoomCoordinator {
    pub fn new(registry: SharedRegistry, results: ResultsTx, timings: RaceTimings) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            registry,
            results,
            timings,
        }
    }

    /// Register a room from the catalog. The room starts `waiting` and
    /// empty; participants arrive over WebSocket afterwards.
    pub fn create_room(&self, new: NewRoom) -> Result<RoomSnapshot, RoomError> {
        if (new.max_players as usize) < MIN_PLAYERS_TO_START {
            return Err(RoomError::CapacityTooSmall(new.max_players));
        }
        let mut rooms = self.rooms.write().unwrap();
        if rooms.contains_key(&new.id) {
            return Err(RoomError::AlreadyExists);
        }
        let room = Room {
            id: new.id.clone(),
            name: new.name,
            host_id: new.host_id,
            content_id: new.content_id,
            max_players: new.max_players,
            status: RoomStatus::Waiting,
            created_at: timestamp_ms(),
            countdown_started_at: None,
            started_at: None,
            participants: HashMap::new(),
            last_activity: Instant::now(),
            closing: false,
        };
        let snapshot = room.snapshot();
        tracing::info!(room = %new.id, max_players = new.max_players, "Room created");
        rooms.insert(new.id, Arc::new(Mutex::new(room)));
        Ok(snapshot)
    }

    fn room_handle(&self, room_id: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().unwrap().get(room_id).map(Arc::clone)
    }

    /// Add an authenticated user to a `waiting` room and broadcast the new
    /// membership. The connection must still be the one bound to this user;
    /// a takeover racing the join loses cleanly here.
    pub fn join(
        &self,
        room_id: &str,
        identity: &Identity,
        display_name: Option<String>,
        conn_id: ConnectionId,
        sender: OutboundSender,
    ) -> Result<RoomSnapshot, RoomError> {
        let room_arc = self.room_handle(room_id).ok_or(RoomError::NotFound)?;
        let mut room = room_arc.lock().unwrap();

        if room.closing || room.status != RoomStatus::Waiting {
            return Err(RoomError::NotJoinable);
        }
        if room.participants.contains_key(&identity.user_id) {
            return Err(RoomError::AlreadyJoined);
        }
        if room.participants.len() >= room.max_players as usize {
            return Err(RoomError::Full);
        }

        {
            let mut registry = self.registry.write().unwrap();
            if registry.lookup_by_user(&identity.user_id) != Some(conn_id) {
                return Err(RoomError::ConnectionGone);
            }
            registry.set_room(conn_id, room_id.to_string());
        }

        let username = display_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| identity.username.clone());
        let participant = Participant {
            user_id: identity.user_id.clone(),
            username,
            connection_id: conn_id,
            sender,
            progress: 0.0,
            wpm: 0.0,
            accuracy: 100.0,
            errors: 0,
            finished: false,
            finished_at: None,
            last_update: timestamp_ms(),
        };
        let joined_snapshot = participant.snapshot();
        room.participants.insert(identity.user_id.clone(), participant);
        room.touch();

        tracing::info!(
            room = %room_id, user = %identity.user_id,
            participants = room.participants.len(),
            "Participant joined"
        );
        room.broadcast(&ServerMessage::ParticipantJoined(ParticipantJoinedMsg {
            participant: joined_snapshot,
        }));
        let snapshot = room.snapshot();
        room.broadcast(&ServerMessage::RoomUpdated(RoomUpdatedMsg {
            room: snapshot.clone(),
        }));
        Ok(snapshot)
    }

    /// Remove a participant. Destroys the room when it empties out or when
    /// the host leaves; during `active`, re-evaluates whether everyone still
    /// present has finished.
    pub fn leave(&self, room_id: &str, user_id: &str, reason: LeaveReason) -> LeaveOutcome {
        let Some(room_arc) = self.room_handle(room_id) else {
            return LeaveOutcome::NotFound;
        };

        let destroy = {
            let mut room = room_arc.lock().unwrap();
            let Some(participant) = room.participants.remove(user_id) else {
                return LeaveOutcome::NotParticipant;
            };
            self.registry
                .write()
                .unwrap()
                .clear_room(participant.connection_id, room_id);
            room.touch();
            tracing::info!(
                room = %room_id, user = %user_id, reason = ?reason,
                remaining = room.participants.len(),
                "Participant left"
            );

            room.broadcast(&ServerMessage::ParticipantLeft(ParticipantLeftMsg {
                user_id: user_id.to_string(),
            }));
            let snapshot = room.snapshot();
            room.broadcast(&ServerMessage::RoomUpdated(RoomUpdatedMsg { room: snapshot }));

            if room.closing {
                None
            } else if room.participants.is_empty() {
                room.closing = true;
                Some(DestroyReason::Empty)
            } else if room.host_id == user_id {
                room.closing = true;
                Some(DestroyReason::HostLeft)
            } else {
                // The departed participant no longer counts towards
                // completion; the race may be done now.
                if room.status == RoomStatus::Active && room.all_finished() {
                    self.finish_race(&mut room);
                }
                None
            }
        };

        match destroy {
            Some(reason) => {
                // The id may have been reused by a fresh room between
                // releasing the room lock and here; destroy only a room
                // already marked closing.
                self.destroy_room_if(room_id, |room| room.closing, reason);
                LeaveOutcome::Destroyed
            },
            None => LeaveOutcome::Left,
        }
    }

    /// Host-only: move a `waiting` room with enough participants into
    /// `countdown` and schedule the tick sequence.
    pub fn start_race(&self, room_id: &str, user_id: &str) -> Result<(), RoomError> {
        let room_arc = self.room_handle(room_id).ok_or(RoomError::NotFound)?;
        {
            let mut room = room_arc.lock().unwrap();
            if room.closing {
                return Err(RoomError::NotFound);
            }
            if room.host_id != user_id {
                return Err(RoomError::NotHost);
            }
            if !room.status.can_transition_to(RoomStatus::Countdown) {
                return Err(RoomError::AlreadyStarted);
            }
            if room.participants.len() < MIN_PLAYERS_TO_START {
                return Err(RoomError::NotEnoughPlayers);
            }
            room.status = RoomStatus::Countdown;
            room.countdown_started_at = Some(timestamp_ms());
            room.touch();
            tracing::info!(
                room = %room_id, host = %user_id,
                participants = room.participants.len(),
                "Race countdown started"
            );
        }
        self.spawn_countdown(&room_arc);
        Ok(())
    }

    /// Countdown tick task. Holds only a weak handle to the room and
    /// re-validates existence and status on every wake, so destruction or a
    /// host departure makes the next tick a silent no-op.
    fn spawn_countdown(&self, room_arc: &Arc<Mutex<Room>>) {
        let weak = Arc::downgrade(room_arc);
        let timings = self.timings;
        tokio::spawn(async move {
            let mut remaining = timings.countdown_from as i64;
            loop {
                {
                    let Some(room_arc) = weak.upgrade() else { return };
                    let mut room = room_arc.lock().unwrap();
                    if room.closing || room.status != RoomStatus::Countdown {
                        tracing::debug!(room = %room.id, "Countdown cancelled");
                        return;
                    }
                    if remaining >= 0 {
                        room.broadcast(&ServerMessage::RaceCountdown(RaceCountdownMsg {
                            room_id: room.id.clone(),
                            countdown: remaining as u32,
                        }));
                    } else {
                        let start_time = timestamp_ms();
                        room.status = RoomStatus::Active;
                        room.started_at = Some(start_time);
                        room.touch();
                        room.broadcast(&ServerMessage::RaceStarted(RaceStartedMsg {
                            room_id: room.id.clone(),
                            start_time,
                        }));
                        tracing::info!(
                            room = %room.id,
                            countdown_ms = room
                                .countdown_started_at
                                .map(|t| start_time - t)
                                .unwrap_or_default(),
                            "Race started"
                        );
                        return;
                    }
                }
                remaining -= 1;
                tokio::time::sleep(timings.countdown_interval).await;
            }
        });
    }

    /// Apply a progress update from a participant of an `active` room and
    /// broadcast the refreshed snapshot. Crossing 100 marks the participant
    /// finished; when the last present participant finishes the race ends.
    pub fn apply_progress(
        &self,
        room_id: &str,
        user_id: &str,
        update: &TypingProgressMsg,
    ) -> Result<(), RoomError> {
        let room_arc = self.room_handle(room_id).ok_or(RoomError::NotFound)?;
        let mut room = room_arc.lock().unwrap();

        if !room.participants.contains_key(user_id) {
            return Err(RoomError::NotParticipant);
        }
        if room.closing || room.status != RoomStatus::Active {
            return Err(RoomError::NotActive);
        }

        let now = timestamp_ms();
        let progress = update.progress.clamp(0.0, 100.0);
        let (finished_now, wpm, accuracy) = {
            let Some(participant) = room.participants.get_mut(user_id) else {
                return Err(RoomError::NotParticipant);
            };
            if participant.finished {
                // Completion is final; late updates change nothing.
                return Ok(());
            }
            participant.progress = progress;
            participant.wpm = update.wpm;
            participant.accuracy = update.accuracy;
            participant.errors = update.errors;
            participant.last_update = now;
            let finished_now = progress >= 100.0;
            if finished_now {
                participant.finished = true;
                participant.finished_at = Some(now);
            }
            (finished_now, participant.wpm, participant.accuracy)
        };
        room.touch();

        let snapshot = room.snapshot();
        room.broadcast(&ServerMessage::RoomUpdated(RoomUpdatedMsg { room: snapshot }));

        if finished_now {
            tracing::info!(room = %room_id, user = %user_id, wpm, "Participant finished");
            room.broadcast(&ServerMessage::ParticipantFinished(ParticipantFinishedMsg {
                user_id: user_id.to_string(),
                finished_at: now,
                wpm,
                accuracy,
            }));
            if room.all_finished() {
                self.finish_race(&mut room);
            }
        }
        Ok(())
    }

    /// Terminal transition. The status guard makes this exactly-once no
    /// matter how many paths race towards it.
    fn finish_race(&self, room: &mut Room) {
        if room.status != RoomStatus::Active {
            return;
        }
        room.status = RoomStatus::Finished;
        let finished_at = timestamp_ms();
        room.touch();
        room.broadcast(&ServerMessage::RaceFinished(RaceFinishedMsg {
            room_id: room.id.clone(),
        }));
        tracing::info!(
            room = %room.id,
            duration_ms = room.started_at.map(|t| finished_at - t).unwrap_or_default(),
            "Race finished"
        );

        let mut results: Vec<ParticipantResult> =
            room.participants.values().map(Participant::result).collect();
        results.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        let outcome = RaceOutcome {
            room_id: room.id.clone(),
            name: room.name.clone(),
            content_id: room.content_id.clone(),
            started_at: room.started_at,
            finished_at,
            results,
        };
        // Fire-and-forget: persistence being gone never affects the room.
        if let Err(e) = self.results.send(outcome) {
            tracing::warn!(room = %room.id, error = %e, "Race outcome hand-off failed");
        }

        self.schedule_teardown(room.id.clone());
    }

    /// Finished rooms linger briefly so clients can fetch final standings,
    /// then go away. Re-validates status on wake: the id may have been
    /// reused by a fresh room in the meantime.
    fn schedule_teardown(&self, room_id: RoomId) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(coordinator.timings.finished_teardown).await;
            coordinator.destroy_room_if(
                &room_id,
                |room| room.status == RoomStatus::Finished,
                DestroyReason::RaceComplete,
            );
        });
    }

    /// Remove a room if `predicate` holds for it, notifying any remaining
    /// participants and releasing their registry room-bindings.
    fn destroy_room_if<F>(&self, room_id: &str, predicate: F, reason: DestroyReason) -> bool
    where
        F: FnOnce(&Room) -> bool,
    {
        let removed = {
            let mut rooms = self.rooms.write().unwrap();
            let Some(room_arc) = rooms.get(room_id) else {
                return false;
            };
            let matches = {
                let mut room = room_arc.lock().unwrap();
                if predicate(&room) {
                    room.closing = true;
                    true
                } else {
                    false
                }
            };
            if matches { rooms.remove(room_id) } else { None }
        };
        let Some(room_arc) = removed else {
            return false;
        };

        let room = room_arc.lock().unwrap();
        room.broadcast(&ServerMessage::RoomLeft(RoomLeftMsg {
            room_id: room.id.clone(),
            reason: Some(reason.as_str().to_string()),
        }));
        {
            let mut registry = self.registry.write().unwrap();
            for participant in room.participants.values() {
                registry.clear_room(participant.connection_id, room_id);
            }
        }
        tracing::info!(
            room = %room_id, reason = reason.as_str(),
            lived_ms = timestamp_ms() - room.created_at,
            "Room destroyed"
        );
        true
    }

    /// Remove rooms with no activity for `max_idle`. Returns the number
    /// destroyed.
    pub fn cleanup_idle_rooms(&self, max_idle: Duration) -> usize {
        let candidates: Vec<RoomId> = {
            let rooms = self.rooms.read().unwrap();
            rooms
                .iter()
                .filter(|(_, room_arc)| {
                    let room = room_arc.lock().unwrap();
                    !room.closing && room.last_activity.elapsed() >= max_idle
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        candidates
            .into_iter()
            .filter(|id| {
                self.destroy_room_if(
                    id,
                    |room| room.last_activity.elapsed() >= max_idle,
                    DestroyReason::Idle,
                )
            })
            .count()
    }

    pub fn snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        let room_arc = self.room_handle(room_id)?;
        let room = room_arc.lock().unwrap();
        Some(room.snapshot())
    }

    pub fn participants(&self, room_id: &str) -> Option<Vec<ParticipantSnapshot>> {
        self.snapshot(room_id).map(|s| s.participants)
    }

    pub fn room_status(&self, room_id: &str) -> Option<RoomStatus> {
        let room_arc = self.room_handle(room_id)?;
        let room = room_arc.lock().unwrap();
        Some(room.status)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap().len()
    }

    /// (room count, total participants) for health reporting.
    pub fn stats(&self) -> (usize, usize) {
        let rooms = self.rooms.read().unwrap();
        let participants = rooms
            .values()
            .map(|room_arc| room_arc.lock().unwrap().participants.len())
            .sum();
        (rooms.len(), participants)
    }
}
