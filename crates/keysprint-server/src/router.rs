use axum::extract::ws::Message;

use keysprint_core::net::messages::{
    AuthenticatedMsg, ClientMessage, ConnectionId, JoinRoomMsg, RoomJoinedMsg, RoomLeftMsg,
    ServerMessage, TypingProgressMsg,
};
use keysprint_core::net::protocol::{ProtocolError, decode_client_message, encode_server_message};

use crate::auth::verify_session_token;
use crate::room_coordinator::{LeaveOutcome, LeaveReason, RoomError};
use crate::state::AppState;

/// Dispatch one inbound text frame. Failures never propagate out of here:
/// every rejection becomes a directed `error` reply to the sender, and
/// broadcasts to the room are left to the coordinator.
pub fn handle_message(state: &AppState, conn_id: ConnectionId, text: &str) {
    let msg = match decode_client_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            let reason = match &e {
                ProtocolError::UnknownKind(kind) => format!("unknown_kind:{kind}"),
                ProtocolError::PayloadTooLarge(_) => "message_too_large".to_string(),
                _ => "invalid_message".to_string(),
            };
            tracing::debug!(connection = %conn_id, error = %e, "Rejected inbound frame");
            send_error(state, conn_id, reason);
            return;
        },
    };

    match msg {
        ClientMessage::Ping => reply(state, conn_id, &ServerMessage::Pong),
        ClientMessage::Authenticate(auth) => handle_authenticate(state, conn_id, &auth.token),
        ClientMessage::JoinRoom(join) => handle_join(state, conn_id, join),
        ClientMessage::LeaveRoom => handle_leave(state, conn_id),
        ClientMessage::StartRace => handle_start(state, conn_id),
        ClientMessage::TypingProgress(update) => handle_progress(state, conn_id, &update),
    }
}

fn handle_authenticate(state: &AppState, conn_id: ConnectionId, token: &str) {
    // No secret configured means no token can be honored.
    let Some(secret) = state.auth.session_secret.as_deref() else {
        send_error(state, conn_id, "invalid_token");
        return;
    };
    let identity = match verify_session_token(token, secret) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::debug!(connection = %conn_id, error = %e, "Session token rejected");
            send_error(state, conn_id, "invalid_token");
            return;
        },
    };

    let displaced = match state.registry.write().unwrap().bind(conn_id, identity.clone()) {
        Ok(displaced) => displaced,
        // The socket closed while the frame was in flight; nothing to do.
        Err(e) => {
            tracing::debug!(connection = %conn_id, error = %e, "Bind on a dead connection");
            return;
        },
    };

    if let Some(old_conn) = displaced {
        tracing::info!(
            user = %identity.user_id, old = %old_conn, new = %conn_id,
            "Identity takeover, displacing previous connection"
        );
        evict_connection(state, old_conn);
    }

    reply(
        state,
        conn_id,
        &ServerMessage::Authenticated(AuthenticatedMsg {
            user_id: identity.user_id,
            username: identity.username,
        }),
    );
}

fn handle_join(state: &AppState, conn_id: ConnectionId, join: JoinRoomMsg) {
    let (identity, current_room, sender) = {
        let registry = state.registry.read().unwrap();
        (
            registry.identity_of(conn_id),
            registry.room_of(conn_id),
            registry.sender_of(conn_id),
        )
    };
    let Some(identity) = identity else {
        send_error(state, conn_id, "not_authenticated");
        return;
    };
    let Some(sender) = sender else {
        return;
    };

    // The bound identity is authoritative; a userId in the payload is
    // advisory and a mismatch is logged, never honored.
    if let Some(ref claimed) = join.user_id
        && *claimed != identity.user_id
    {
        tracing::debug!(
            connection = %conn_id, claimed = %claimed, bound = %identity.user_id,
            "Ignoring payload userId"
        );
    }

    if let Some(old_room) = current_room {
        if old_room == join.room_id {
            send_error(state, conn_id, RoomError::AlreadyJoined.wire_code());
            return;
        }
        // Joining a different room is an implicit leave of the current one.
        leave_current_room(state, conn_id, &old_room, &identity.user_id);
    }

    match state
        .rooms
        .join(&join.room_id, &identity, join.username, conn_id, sender)
    {
        Ok(room) => {
            reply(
                state,
                conn_id,
                &ServerMessage::RoomJoined(RoomJoinedMsg {
                    room_id: join.room_id,
                    room,
                }),
            );
        },
        Err(e) => {
            tracing::debug!(
                connection = %conn_id, room = %join.room_id, error = %e,
                "Join rejected"
            );
            send_error(state, conn_id, e.wire_code());
        },
    }
}

fn handle_leave(state: &AppState, conn_id: ConnectionId) {
    let (identity, current_room) = {
        let registry = state.registry.read().unwrap();
        (registry.identity_of(conn_id), registry.room_of(conn_id))
    };
    let Some(identity) = identity else {
        send_error(state, conn_id, "not_authenticated");
        return;
    };
    let Some(room_id) = current_room else {
        send_error(state, conn_id, RoomError::NotParticipant.wire_code());
        return;
    };
    leave_current_room(state, conn_id, &room_id, &identity.user_id);
}

/// Run the leave cascade and confirm with a directed `room_left`. A room
/// that already went away still counts as having been left; the stale
/// connection mapping is reconciled here.
fn leave_current_room(state: &AppState, conn_id: ConnectionId, room_id: &str, user_id: &str) {
    let outcome = state.rooms.leave(room_id, user_id, LeaveReason::Left);
    if matches!(outcome, LeaveOutcome::NotFound | LeaveOutcome::NotParticipant) {
        state.registry.write().unwrap().clear_room(conn_id, room_id);
    }
    reply(
        state,
        conn_id,
        &ServerMessage::RoomLeft(RoomLeftMsg {
            room_id: room_id.to_string(),
            reason: Some("left".to_string()),
        }),
    );
}

fn handle_start(state: &AppState, conn_id: ConnectionId) {
    let (identity, current_room) = {
        let registry = state.registry.read().unwrap();
        (registry.identity_of(conn_id), registry.room_of(conn_id))
    };
    let Some(identity) = identity else {
        send_error(state, conn_id, "not_authenticated");
        return;
    };
    let Some(room_id) = current_room else {
        send_error(state, conn_id, RoomError::NotParticipant.wire_code());
        return;
    };
    // Success is announced by the countdown broadcast, not a directed reply.
    if let Err(e) = state.rooms.start_race(&room_id, &identity.user_id) {
        tracing::debug!(
            connection = %conn_id, room = %room_id, error = %e,
            "Start rejected"
        );
        send_error(state, conn_id, e.wire_code());
    }
}

fn handle_progress(state: &AppState, conn_id: ConnectionId, update: &TypingProgressMsg) {
    let (identity, current_room) = {
        let registry = state.registry.read().unwrap();
        (registry.identity_of(conn_id), registry.room_of(conn_id))
    };
    let Some(identity) = identity else {
        send_error(state, conn_id, "not_authenticated");
        return;
    };
    let Some(room_id) = current_room else {
        send_error(state, conn_id, RoomError::NotParticipant.wire_code());
        return;
    };
    if let Err(e) = state.rooms.apply_progress(&room_id, &identity.user_id, update) {
        send_error(state, conn_id, e.wire_code());
    }
}

/// Close a displaced connection and run its disconnect cascade. The close
/// frame gives the old client a clean shutdown; the cascade runs regardless
/// of whether the frame can still be delivered.
fn evict_connection(state: &AppState, conn_id: ConnectionId) {
    state
        .registry
        .read()
        .unwrap()
        .send_to(conn_id, Message::Close(None));
    teardown_connection(state, conn_id);
}

/// Full disconnect cascade: atomically remove the registry entry, then run
/// the room-leave fan-out with the connection's final identity and room.
pub fn teardown_connection(state: &AppState, conn_id: ConnectionId) {
    let removed = state.registry.write().unwrap().unregister(conn_id);
    let Some(removed) = removed else {
        return;
    };
    if let (Some(identity), Some(room_id)) = (removed.identity, removed.room) {
        state
            .rooms
            .leave(&room_id, &identity.user_id, LeaveReason::Disconnected);
    }
}

fn reply(state: &AppState, conn_id: ConnectionId, msg: &ServerMessage) {
    match encode_server_message(msg) {
        Ok(text) => {
            state
                .registry
                .read()
                .unwrap()
                .send_to(conn_id, Message::Text(text.into()));
        },
        Err(e) => {
            tracing::warn!(
                connection = %conn_id, kind = msg.kind(), error = %e,
                "Failed to encode reply"
            );
        },
    }
}

pub fn send_error(state: &AppState, conn_id: ConnectionId, reason: impl Into<String>) {
    reply(state, conn_id, &ServerMessage::error(reason));
}
