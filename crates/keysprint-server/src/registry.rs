use std::collections::HashMap;
use std::time::Instant;

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use uuid::Uuid;

use keysprint_core::net::messages::ConnectionId;
use keysprint_core::room::{RoomId, UserId};

use crate::auth::Identity;

/// Per-connection sender for outbound WebSocket frames.
/// Bounded (see `limits.connection_buffer`) so slow clients drop frames
/// instead of exhausting memory. Text frames share their payload bytes,
/// making clones cheap when broadcasting.
pub type OutboundSender = mpsc::Sender<Message>;

/// One live WebSocket connection.
struct Connection {
    sender: OutboundSender,
    /// Cleared when a heartbeat probe goes out; any inbound traffic sets it.
    alive: bool,
    last_heartbeat: Instant,
    identity: Option<Identity>,
    room: Option<RoomId>,
}

/// What `heartbeat_tick` decided about a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// Still alive; a new probe should be sent.
    Probe,
    /// The previous probe went unanswered.
    Dead,
    /// Unknown connection (already unregistered).
    Gone,
}

/// Final state of a connection removed by `unregister`, for the caller to
/// run the room-leave cascade with.
#[derive(Debug)]
pub struct RemovedConnection {
    pub identity: Option<Identity>,
    pub room: Option<RoomId>,
}

/// Tracks every live connection and the user-identity -> connection mapping.
/// One instance per server, behind `state::SharedRegistry`.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    by_user: HashMap<UserId, ConnectionId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection. Never fails.
    pub fn register(&mut self, sender: OutboundSender) -> ConnectionId {
        let id = Uuid::new_v4();
        self.connections.insert(
            id,
            Connection {
                sender,
                alive: true,
                last_heartbeat: Instant::now(),
                identity: None,
                room: None,
            },
        );
        id
    }

    /// Bind an identity to a connection, last writer wins. Returns the
    /// connection previously bound to this user, which the caller must tear
    /// down. Fails only if the connection is already gone.
    pub fn bind(
        &mut self,
        conn_id: ConnectionId,
        identity: Identity,
    ) -> Result<Option<ConnectionId>, String> {
        if !self.connections.contains_key(&conn_id) {
            return Err("Connection not registered".to_string());
        }

        let displaced = match self.by_user.get(&identity.user_id) {
            Some(&existing) if existing != conn_id => Some(existing),
            _ => None,
        };

        // A connection re-authenticating as someone else releases its old
        // user entry (guarded, same rule as unregister).
        if let Some(conn) = self.connections.get(&conn_id)
            && let Some(ref old) = conn.identity
            && old.user_id != identity.user_id
            && self.by_user.get(&old.user_id) == Some(&conn_id)
        {
            self.by_user.remove(&old.user_id);
        }

        self.by_user.insert(identity.user_id.clone(), conn_id);
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.identity = Some(identity);
        }
        Ok(displaced)
    }

    /// Remove a connection. Clears the identity map entry only if it still
    /// points at this connection, so a displaced connection's late teardown
    /// never evicts its successor.
    pub fn unregister(&mut self, conn_id: ConnectionId) -> Option<RemovedConnection> {
        let conn = self.connections.remove(&conn_id)?;
        if let Some(ref identity) = conn.identity
            && self.by_user.get(&identity.user_id) == Some(&conn_id)
        {
            self.by_user.remove(&identity.user_id);
        }
        Some(RemovedConnection {
            identity: conn.identity,
            room: conn.room,
        })
    }

    /// Advance the heartbeat state machine for one connection.
    pub fn heartbeat_tick(&mut self, conn_id: ConnectionId) -> HeartbeatVerdict {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return HeartbeatVerdict::Gone;
        };
        if !conn.alive {
            tracing::debug!(
                conn = %conn_id,
                silent_for = ?conn.last_heartbeat.elapsed(),
                "Heartbeat probe unanswered"
            );
            return HeartbeatVerdict::Dead;
        }
        conn.alive = false;
        HeartbeatVerdict::Probe
    }

    /// Record proof of life (any inbound frame counts).
    pub fn mark_alive(&mut self, conn_id: ConnectionId) {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.alive = true;
            conn.last_heartbeat = Instant::now();
        }
    }

    pub fn identity_of(&self, conn_id: ConnectionId) -> Option<Identity> {
        self.connections.get(&conn_id)?.identity.clone()
    }

    pub fn room_of(&self, conn_id: ConnectionId) -> Option<RoomId> {
        self.connections.get(&conn_id)?.room.clone()
    }

    pub fn lookup_by_user(&self, user_id: &str) -> Option<ConnectionId> {
        self.by_user.get(user_id).copied()
    }

    pub fn sender_of(&self, conn_id: ConnectionId) -> Option<OutboundSender> {
        self.connections.get(&conn_id).map(|c| c.sender.clone())
    }

    /// Record which room a connection is in.
    pub fn set_room(&mut self, conn_id: ConnectionId, room_id: RoomId) {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.room = Some(room_id);
        }
    }

    /// Clear a connection's room, but only if it still names `room_id`.
    /// A stale clear from a destroyed room must not erase a newer join.
    pub fn clear_room(&mut self, conn_id: ConnectionId, room_id: &str) {
        if let Some(conn) = self.connections.get_mut(&conn_id)
            && conn.room.as_deref() == Some(room_id)
        {
            conn.room = None;
        }
    }

    /// Send a frame to one connection, dropping it if the channel is full
    /// or closed.
    pub fn send_to(&self, conn_id: ConnectionId, message: Message) {
        if let Some(conn) = self.connections.get(&conn_id)
            && let Err(e) = conn.sender.try_send(message)
        {
            tracing::debug!(
                conn = %conn_id, error = %e,
                "Failed to send to connection (slow or disconnected)"
            );
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn authenticated_count(&self) -> usize {
        self.by_user.len()
    }
}
