use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::time::timestamp_ms;

use super::messages::{ClientMessage, ServerMessage};

/// Maximum encoded envelope size in bytes.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024; // 16 KiB

#[derive(Debug)]
pub enum ProtocolError {
    EmptyMessage,
    UnknownKind(String),
    PayloadTooLarge(usize),
    SerializeError(String),
    DeserializeError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::UnknownKind(kind) => write!(f, "unknown kind: {kind}"),
            Self::PayloadTooLarge(size) => {
                write!(f, "message too large: {size} bytes (max {MAX_MESSAGE_SIZE})")
            },
            Self::SerializeError(e) => write!(f, "serialize error: {e}"),
            Self::DeserializeError(e) => write!(f, "deserialize error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Wire envelope: `{"kind": ..., "data": ..., "timestamp": ...}`. The `data`
/// object is omitted for kinds that carry no payload; inbound timestamps are
/// informational and never validated.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default)]
    timestamp: i64,
}

fn encode_envelope(kind: &str, data: Option<Value>) -> Result<String, ProtocolError> {
    let envelope = Envelope {
        kind: kind.to_string(),
        data,
        timestamp: timestamp_ms(),
    };
    let text = serde_json::to_string(&envelope)
        .map_err(|e| ProtocolError::SerializeError(e.to_string()))?;
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge(text.len()));
    }
    Ok(text)
}

fn encode_data<T: Serialize>(payload: &T) -> Result<Option<Value>, ProtocolError> {
    serde_json::to_value(payload)
        .map(Some)
        .map_err(|e| ProtocolError::SerializeError(e.to_string()))
}

fn decode_envelope(raw: &str) -> Result<Envelope, ProtocolError> {
    if raw.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    if raw.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge(raw.len()));
    }
    serde_json::from_str(raw).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
}

fn decode_data<T: DeserializeOwned>(data: Option<Value>) -> Result<T, ProtocolError> {
    let data = data.ok_or_else(|| ProtocolError::DeserializeError("missing data".to_string()))?;
    serde_json::from_value(data).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
}

/// Encode a `ClientMessage` to wire format.
pub fn encode_client_message(msg: &ClientMessage) -> Result<String, ProtocolError> {
    let data = match msg {
        ClientMessage::Ping | ClientMessage::LeaveRoom | ClientMessage::StartRace => None,
        ClientMessage::Authenticate(m) => encode_data(m)?,
        ClientMessage::JoinRoom(m) => encode_data(m)?,
        ClientMessage::TypingProgress(m) => encode_data(m)?,
    };
    encode_envelope(msg.kind(), data)
}

/// Encode a `ServerMessage` to wire format.
pub fn encode_server_message(msg: &ServerMessage) -> Result<String, ProtocolError> {
    let data = match msg {
        ServerMessage::Pong => None,
        ServerMessage::Connected(m) => encode_data(m)?,
        ServerMessage::Authenticated(m) => encode_data(m)?,
        ServerMessage::RoomJoined(m) => encode_data(m)?,
        ServerMessage::RoomLeft(m) => encode_data(m)?,
        ServerMessage::RoomUpdated(m) => encode_data(m)?,
        ServerMessage::ParticipantJoined(m) => encode_data(m)?,
        ServerMessage::ParticipantLeft(m) => encode_data(m)?,
        ServerMessage::RaceCountdown(m) => encode_data(m)?,
        ServerMessage::RaceStarted(m) => encode_data(m)?,
        ServerMessage::ParticipantFinished(m) => encode_data(m)?,
        ServerMessage::RaceFinished(m) => encode_data(m)?,
        ServerMessage::Error(m) => encode_data(m)?,
    };
    encode_envelope(msg.kind(), data)
}

/// Decode raw wire text into a `ClientMessage`.
pub fn decode_client_message(raw: &str) -> Result<ClientMessage, ProtocolError> {
    let envelope = decode_envelope(raw)?;
    match envelope.kind.as_str() {
        "ping" => Ok(ClientMessage::Ping),
        "authenticate" => Ok(ClientMessage::Authenticate(decode_data(envelope.data)?)),
        "join_room" => Ok(ClientMessage::JoinRoom(decode_data(envelope.data)?)),
        "leave_room" => Ok(ClientMessage::LeaveRoom),
        "start_race" => Ok(ClientMessage::StartRace),
        "typing_progress" => Ok(ClientMessage::TypingProgress(decode_data(envelope.data)?)),
        _ => Err(ProtocolError::UnknownKind(envelope.kind.clone())),
    }
}

/// Decode raw wire text into a `ServerMessage`.
pub fn decode_server_message(raw: &str) -> Result<ServerMessage, ProtocolError> {
    let envelope = decode_envelope(raw)?;
    match envelope.kind.as_str() {
        "connected" => Ok(ServerMessage::Connected(decode_data(envelope.data)?)),
        "pong" => Ok(ServerMessage::Pong),
        "authenticated" => Ok(ServerMessage::Authenticated(decode_data(envelope.data)?)),
        "room_joined" => Ok(ServerMessage::RoomJoined(decode_data(envelope.data)?)),
        "room_left" => Ok(ServerMessage::RoomLeft(decode_data(envelope.data)?)),
        "room_updated" => Ok(ServerMessage::RoomUpdated(decode_data(envelope.data)?)),
        "participant_joined" => Ok(ServerMessage::ParticipantJoined(decode_data(envelope.data)?)),
        "participant_left" => Ok(ServerMessage::ParticipantLeft(decode_data(envelope.data)?)),
        "race_countdown" => Ok(ServerMessage::RaceCountdown(decode_data(envelope.data)?)),
        "race_started" => Ok(ServerMessage::RaceStarted(decode_data(envelope.data)?)),
        "participant_finished" => {
            Ok(ServerMessage::ParticipantFinished(decode_data(envelope.data)?))
        },
        "race_finished" => Ok(ServerMessage::RaceFinished(decode_data(envelope.data)?)),
        "error" => Ok(ServerMessage::Error(decode_data(envelope.data)?)),
        _ => Err(ProtocolError::UnknownKind(envelope.kind.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::messages::{
        AuthenticateMsg, ConnectedMsg, ErrorMsg, JoinRoomMsg, RaceCountdownMsg, RoomJoinedMsg,
        TypingProgressMsg,
    };
    use crate::room::{RoomSnapshot, RoomStatus};

    fn test_snapshot() -> RoomSnapshot {
        RoomSnapshot {
            id: "room-1".to_string(),
            name: "Evening sprint".to_string(),
            status: RoomStatus::Waiting,
            host_id: "u-host".to_string(),
            content_id: "passage-3".to_string(),
            max_players: 4,
            started_at: None,
            participants: vec![],
        }
    }

    #[test]
    fn roundtrip_join_room() {
        let msg = ClientMessage::JoinRoom(JoinRoomMsg {
            room_id: "room-1".to_string(),
            user_id: Some("u1".to_string()),
            username: Some("Alice".to_string()),
        });
        let encoded = encode_client_message(&msg).unwrap();
        let decoded = decode_client_message(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn roundtrip_typing_progress() {
        let msg = ClientMessage::TypingProgress(TypingProgressMsg {
            progress: 62.5,
            wpm: 81.0,
            accuracy: 97.2,
            errors: 3,
        });
        let encoded = encode_client_message(&msg).unwrap();
        let decoded = decode_client_message(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn roundtrip_authenticate() {
        let msg = ClientMessage::Authenticate(AuthenticateMsg {
            token: "deadbeef.cafe".to_string(),
        });
        let encoded = encode_client_message(&msg).unwrap();
        let decoded = decode_client_message(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn roundtrip_dataless_kinds() {
        for msg in [
            ClientMessage::Ping,
            ClientMessage::LeaveRoom,
            ClientMessage::StartRace,
        ] {
            let encoded = encode_client_message(&msg).unwrap();
            let decoded = decode_client_message(&encoded).unwrap();
            assert_eq!(msg, decoded);
        }
    }

    #[test]
    fn roundtrip_room_joined() {
        let msg = ServerMessage::RoomJoined(RoomJoinedMsg {
            room_id: "room-1".to_string(),
            room: test_snapshot(),
        });
        let encoded = encode_server_message(&msg).unwrap();
        let decoded = decode_server_message(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn roundtrip_race_countdown() {
        let msg = ServerMessage::RaceCountdown(RaceCountdownMsg {
            room_id: "room-1".to_string(),
            countdown: 5,
        });
        let encoded = encode_server_message(&msg).unwrap();
        let decoded = decode_server_message(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn roundtrip_error() {
        let msg = ServerMessage::Error(ErrorMsg {
            error: "room_full".to_string(),
        });
        let encoded = encode_server_message(&msg).unwrap();
        let decoded = decode_server_message(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    /// A join envelope exactly as a browser client produces it.
    #[test]
    fn decode_join_room_from_js_encoding() {
        let wire = r#"{"kind":"join_room","data":{"roomId":"room-7","userId":"u-42","username":"Nia"},"timestamp":1756100000000}"#;
        let decoded = decode_client_message(wire).expect("should decode join_room");
        match decoded {
            ClientMessage::JoinRoom(m) => {
                assert_eq!(m.room_id, "room-7");
                assert_eq!(m.user_id.as_deref(), Some("u-42"));
                assert_eq!(m.username.as_deref(), Some("Nia"));
            },
            other => panic!("Expected JoinRoom, got {other:?}"),
        }
    }

    #[test]
    fn decode_join_room_without_optional_fields() {
        let wire = r#"{"kind":"join_room","data":{"roomId":"room-7"},"timestamp":0}"#;
        let decoded = decode_client_message(wire).unwrap();
        match decoded {
            ClientMessage::JoinRoom(m) => {
                assert_eq!(m.room_id, "room-7");
                assert!(m.user_id.is_none());
                assert!(m.username.is_none());
            },
            other => panic!("Expected JoinRoom, got {other:?}"),
        }
    }

    #[test]
    fn dataless_kind_tolerates_empty_data_object() {
        let wire = r#"{"kind":"leave_room","data":{},"timestamp":1}"#;
        assert_eq!(
            decode_client_message(wire).unwrap(),
            ClientMessage::LeaveRoom
        );
    }

    #[test]
    fn missing_timestamp_is_tolerated() {
        let wire = r#"{"kind":"ping"}"#;
        assert_eq!(decode_client_message(wire).unwrap(), ClientMessage::Ping);
    }

    #[test]
    fn envelope_shape_on_the_wire() {
        let encoded = encode_server_message(&ServerMessage::Connected(ConnectedMsg {
            connection_id: uuid::Uuid::nil(),
        }))
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["kind"], "connected");
        assert!(value["timestamp"].as_i64().unwrap() > 0);
        assert_eq!(
            value["data"]["connectionId"],
            "00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn dataless_envelope_omits_data() {
        let encoded = encode_server_message(&ServerMessage::Pong).unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert!(value.get("data").is_none());
    }

    #[test]
    fn decode_empty_message_fails() {
        assert!(matches!(
            decode_client_message(""),
            Err(ProtocolError::EmptyMessage)
        ));
    }

    #[test]
    fn decode_unknown_kind_fails() {
        let wire = r#"{"kind":"teleport","data":{},"timestamp":0}"#;
        match decode_client_message(wire) {
            Err(ProtocolError::UnknownKind(kind)) => assert_eq!(kind, "teleport"),
            other => panic!("Expected UnknownKind, got {other:?}"),
        }
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(matches!(
            decode_client_message("not json at all"),
            Err(ProtocolError::DeserializeError(_))
        ));
    }

    #[test]
    fn decode_missing_payload_fails() {
        let wire = r#"{"kind":"typing_progress","timestamp":0}"#;
        assert!(matches!(
            decode_client_message(wire),
            Err(ProtocolError::DeserializeError(_))
        ));
    }

    #[test]
    fn oversized_message_rejected() {
        let padding = "x".repeat(MAX_MESSAGE_SIZE + 1);
        let wire = format!(r#"{{"kind":"ping","data":{{"pad":"{padding}"}}}}"#);
        assert!(matches!(
            decode_client_message(&wire),
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn protocol_error_display() {
        assert_eq!(format!("{}", ProtocolError::EmptyMessage), "empty message");
        assert_eq!(
            format!("{}", ProtocolError::UnknownKind("warp".to_string())),
            "unknown kind: warp"
        );
        assert!(format!("{}", ProtocolError::PayloadTooLarge(99999)).contains("99999"));
        assert!(format!("{}", ProtocolError::SerializeError("boom".into())).contains("boom"));
        assert!(format!("{}", ProtocolError::DeserializeError("oops".into())).contains("oops"));
    }
}
