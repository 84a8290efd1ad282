//! Reliable control-message schema
//!
//! JSON objects tagged by `type`, newline-framed where the transport is
//! stream-oriented. The datagram side carries only raw audio packets; all
//! signaling goes through these messages.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Messages a client sends over the reliable channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on a fresh session: associates it with a room
    /// participant created by the join API.
    Bind {
        participant_id: String,
        room: String,
    },
    /// RTT probe; every field other than `type` is echoed back in the pong.
    Ping {
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// Set how loud `source` is in the sender's own mix.
    SetGain { source: String, gain: f32 },
    /// Mute or unmute `source` in the sender's own mix.
    SetMute { source: String, muted: bool },
}

/// Messages the server sends over the reliable channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    RoomState { participants: Vec<ParticipantEntry> },
    ParticipantJoined { id: String, name: String },
    ParticipantLeft { id: String },
    Pong {
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    VacateRequest,
    Error { error: ErrorCode },
}

/// One `{id, name}` pair in a `room_state` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantEntry {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RoomNotFound,
    ParticipantNotFound,
}

impl ServerMessage {
    /// Wire encoding. These are plain data enums; serialization cannot
    /// fail, so an empty string only ever signals a programming error.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"bind","participant_id":"abc","room":"Allegro"}"#)
                .unwrap();
        match msg {
            ClientMessage::Bind {
                participant_id,
                room,
            } => {
                assert_eq!(participant_id, "abc");
                assert_eq!(room, "Allegro");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn ping_captures_extra_fields_for_echo() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"ping","t0":12345,"nonce":"xyz"}"#).unwrap();
        let ClientMessage::Ping { extra } = msg else {
            panic!("expected ping");
        };
        assert_eq!(extra.get("t0"), Some(&Value::from(12345)));

        let pong = ServerMessage::Pong { extra }.to_json();
        let value: Value = serde_json::from_str(&pong).unwrap();
        assert_eq!(value["type"], "pong");
        assert_eq!(value["t0"], 12345);
        assert_eq!(value["nonce"], "xyz");
    }

    #[test]
    fn set_gain_and_mute_parse() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"set_gain","source":"abc","gain":0.5}"#).unwrap();
        assert!(matches!(msg, ClientMessage::SetGain { gain, .. } if gain == 0.5));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"set_mute","source":"abc","muted":true}"#).unwrap();
        assert!(matches!(msg, ClientMessage::SetMute { muted: true, .. }));
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"shrug"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn server_messages_serialize_with_snake_case_tags() {
        let state = ServerMessage::RoomState {
            participants: vec![ParticipantEntry {
                id: "a1".into(),
                name: "alice".into(),
            }],
        };
        let value: Value = serde_json::from_str(&state.to_json()).unwrap();
        assert_eq!(value["type"], "room_state");
        assert_eq!(value["participants"][0]["name"], "alice");

        let value: Value =
            serde_json::from_str(&ServerMessage::VacateRequest.to_json()).unwrap();
        assert_eq!(value, serde_json::json!({"type": "vacate_request"}));

        let value: Value = serde_json::from_str(
            &ServerMessage::Error {
                error: ErrorCode::RoomNotFound,
            }
            .to_json(),
        )
        .unwrap();
        assert_eq!(value["error"], "room_not_found");
    }
}
