//! JSON event protocol between session clients and the relay.
//!
//! Every WebSocket text frame carries exactly one envelope:
//! ```text
//! { "event": "element-update", "data": { "documentId": "…", "elements": […], … } }
//! ```
//!
//! | event             | direction            | delivery               |
//! |-------------------|----------------------|------------------------|
//! | `join-room`       | client → relay       | reliable               |
//! | `presence-update` | relay → whole room   | reliable, full replace |
//! | `cursor-move`     | client → room others | best-effort            |
//! | `element-update`  | client → room others | reliable               |
//! | `user-activity`   | client → relay       | reliable               |
//!
//! Every payload field has a neutral default so a partially-formed payload
//! from an older client still decodes. An explicit `null` counts as
//! missing, and junk entries in an element list are skipped.

use crate::element::{lenient_elements, null_as_default, null_as_true, Element};
use crate::participant::{Participant, ParticipantIdentity};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

// ───────────────────────────────────────────────────────────────────
// Payloads
// ───────────────────────────────────────────────────────────────────

/// Position in scene coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Pointer {
    #[serde(deserialize_with = "null_as_default")]
    pub x: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub y: f64,
}

impl Pointer {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Ask the relay to add this connection to a document's room.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JoinRoom {
    #[serde(deserialize_with = "null_as_default")]
    pub document_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub participant: ParticipantIdentity,
}

/// Ephemeral cursor position. Safe to drop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CursorFrame {
    #[serde(deserialize_with = "null_as_default")]
    pub document_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub pointer: Pointer,
    /// `"up"` or `"down"`.
    #[serde(deserialize_with = "button_or_up")]
    pub button: String,
    /// Element ids the sender has selected.
    #[serde(deserialize_with = "null_as_default")]
    pub selection: HashMap<String, bool>,
    #[serde(deserialize_with = "null_as_default")]
    pub participant_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub color: String,
}

impl Default for CursorFrame {
    fn default() -> Self {
        Self {
            document_id: String::new(),
            pointer: Pointer::default(),
            button: "up".to_string(),
            selection: HashMap::new(),
            participant_id: String::new(),
            display_name: String::new(),
            avatar: None,
            color: String::new(),
        }
    }
}

/// Elements that changed since the sender last broadcast.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ElementDelta {
    #[serde(deserialize_with = "null_as_default")]
    pub document_id: String,
    #[serde(deserialize_with = "lenient_elements")]
    pub elements: Vec<Element>,
    #[serde(deserialize_with = "null_as_default")]
    pub participant_id: String,
}

/// Focus/blur of the sender's editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserActivity {
    #[serde(deserialize_with = "null_as_default")]
    pub document_id: String,
    #[serde(deserialize_with = "null_as_true")]
    pub is_active: bool,
}

impl Default for UserActivity {
    fn default() -> Self {
        Self {
            document_id: String::new(),
            is_active: true,
        }
    }
}

fn button_or_up<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| "up".to_string()))
}

// ───────────────────────────────────────────────────────────────────
// Envelopes
// ───────────────────────────────────────────────────────────────────

/// Events a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinRoom(JoinRoom),
    CursorMove(CursorFrame),
    ElementUpdate(ElementDelta),
    UserActivity(UserActivity),
}

/// Events the relay delivers to room members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    PresenceUpdate(Vec<Participant>),
    CursorMove(CursorFrame),
    ElementUpdate(ElementDelta),
}

/// How the relay hands an event to a room member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClass {
    /// Ordered and never dropped.
    Reliable,
    /// Dropped when the member's cursor queue is full.
    Volatile,
}

impl ClientEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Wire name of the event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom(_) => "join-room",
            ClientEvent::CursorMove(_) => "cursor-move",
            ClientEvent::ElementUpdate(_) => "element-update",
            ClientEvent::UserActivity(_) => "user-activity",
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            ClientEvent::JoinRoom(p) => &p.document_id,
            ClientEvent::CursorMove(p) => &p.document_id,
            ClientEvent::ElementUpdate(p) => &p.document_id,
            ClientEvent::UserActivity(p) => &p.document_id,
        }
    }
}

impl ServerEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::PresenceUpdate(_) => "presence-update",
            ServerEvent::CursorMove(_) => "cursor-move",
            ServerEvent::ElementUpdate(_) => "element-update",
        }
    }

    pub fn delivery(&self) -> DeliveryClass {
        match self {
            ServerEvent::CursorMove(_) => DeliveryClass::Volatile,
            ServerEvent::PresenceUpdate(_) | ServerEvent::ElementUpdate(_) => {
                DeliveryClass::Reliable
            }
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::ConnectionId;
    use serde_json::{json, Value};

    #[test]
    fn test_join_room_wire_shape() {
        let event = ClientEvent::JoinRoom(JoinRoom {
            document_id: "doc-1".into(),
            participant: ParticipantIdentity::with_id("u1", "Ada"),
        });
        let value: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();

        assert_eq!(value["event"], json!("join-room"));
        assert_eq!(value["data"]["documentId"], json!("doc-1"));
        assert_eq!(value["data"]["participant"]["name"], json!("Ada"));
        assert_eq!(value["data"]["participant"]["initials"], json!("A"));
    }

    #[test]
    fn test_decode_element_update() {
        let raw = br#"{
            "event": "element-update",
            "data": {
                "documentId": "doc-1",
                "participantId": "u1",
                "elements": [{ "id": "a", "version": 2, "versionNonce": 7, "updated": 10, "type": "ellipse" }]
            }
        }"#;
        let event = ClientEvent::decode(raw).unwrap();
        assert_eq!(event.name(), "element-update");
        assert_eq!(event.document_id(), "doc-1");
        match event {
            ClientEvent::ElementUpdate(delta) => {
                assert_eq!(delta.elements.len(), 1);
                assert_eq!(delta.elements[0].version, 2);
                assert_eq!(delta.elements[0].attributes["type"], json!("ellipse"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_cursor_defaults_when_fields_missing() {
        let raw = br#"{ "event": "cursor-move", "data": { "documentId": "d" } }"#;
        match ClientEvent::decode(raw).unwrap() {
            ClientEvent::CursorMove(frame) => {
                assert_eq!(frame.button, "up");
                assert!(frame.selection.is_empty());
                assert_eq!(frame.pointer, Pointer::default());
                assert!(frame.avatar.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_user_activity_defaults_active() {
        let raw = br#"{ "event": "user-activity", "data": {} }"#;
        assert_eq!(
            ClientEvent::decode(raw).unwrap(),
            ClientEvent::UserActivity(UserActivity::default())
        );
    }

    #[test]
    fn test_cursor_omits_missing_avatar() {
        let frame = CursorFrame {
            document_id: "d".into(),
            pointer: Pointer::new(1.5, -2.0),
            participant_id: "u1".into(),
            ..CursorFrame::default()
        };
        let value: Value =
            serde_json::from_str(&ServerEvent::CursorMove(frame).encode().unwrap()).unwrap();
        assert_eq!(value["event"], json!("cursor-move"));
        assert_eq!(value["data"]["pointer"], json!({ "x": 1.5, "y": -2.0 }));
        assert!(value["data"].get("avatar").is_none());
    }

    #[test]
    fn test_presence_update_is_array() {
        let event = ServerEvent::PresenceUpdate(vec![Participant::new(
            ParticipantIdentity::with_id("u1", "Ada"),
            ConnectionId::new(),
        )]);
        let value: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(value["event"], json!("presence-update"));
        assert!(value["data"].is_array());
        assert_eq!(ServerEvent::decode(event.encode().unwrap().as_bytes()).unwrap(), event);
    }

    #[test]
    fn test_delivery_classes() {
        assert_eq!(
            ServerEvent::CursorMove(CursorFrame::default()).delivery(),
            DeliveryClass::Volatile
        );
        assert_eq!(
            ServerEvent::ElementUpdate(ElementDelta::default()).delivery(),
            DeliveryClass::Reliable
        );
        assert_eq!(ServerEvent::PresenceUpdate(vec![]).delivery(), DeliveryClass::Reliable);
    }

    #[test]
    fn test_decode_garbage_is_error() {
        assert!(matches!(
            ClientEvent::decode(b"not json"),
            Err(ProtocolError::Deserialization(_))
        ));
        assert!(ClientEvent::decode(br#"{"event":"teleport","data":{}}"#).is_err());
    }

    #[test]
    fn test_null_elements_decode_as_empty_delta() {
        let raw = br#"{ "event": "element-update", "data": { "documentId": "d", "elements": null, "participantId": null } }"#;
        match ClientEvent::decode(raw).unwrap() {
            ClientEvent::ElementUpdate(delta) => {
                assert_eq!(delta.document_id, "d");
                assert!(delta.elements.is_empty());
                assert!(delta.participant_id.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_junk_entries_skipped_in_element_list() {
        let raw = br#"{
            "event": "element-update",
            "data": {
                "documentId": "d",
                "elements": [{ "id": "a", "version": 2 }, 7, null, "b", { "id": "c", "version": 1 }]
            }
        }"#;
        match ClientEvent::decode(raw).unwrap() {
            ClientEvent::ElementUpdate(delta) => {
                let ids: Vec<_> = delta.elements.iter().map(|e| e.id.as_str()).collect();
                assert_eq!(ids, ["a", "c"]);
                assert_eq!(delta.elements[0].version, 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_null_cursor_fields_take_defaults() {
        let raw = br#"{
            "event": "cursor-move",
            "data": {
                "documentId": "d",
                "pointer": { "x": 4, "y": null },
                "button": null,
                "selection": null,
                "displayName": null,
                "avatar": null,
                "color": null
            }
        }"#;
        match ClientEvent::decode(raw).unwrap() {
            ClientEvent::CursorMove(frame) => {
                assert_eq!(frame.pointer, Pointer::new(4.0, 0.0));
                assert_eq!(frame.button, "up");
                assert!(frame.selection.is_empty());
                assert!(frame.display_name.is_empty());
                assert!(frame.avatar.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }

        let raw = br#"{ "event": "cursor-move", "data": { "documentId": "d", "pointer": null } }"#;
        assert!(ClientEvent::decode(raw).is_ok());
    }

    #[test]
    fn test_null_participant_fields_on_join() {
        let raw = br#"{
            "event": "join-room",
            "data": { "documentId": "d", "participant": { "id": "u1", "name": null, "color": null } }
        }"#;
        match ClientEvent::decode(raw).unwrap() {
            ClientEvent::JoinRoom(join) => {
                assert_eq!(join.participant.id, "u1");
                assert!(join.participant.name.is_empty());
                assert!(join.participant.color.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }

        let raw = br#"{ "event": "join-room", "data": { "documentId": "d", "participant": null } }"#;
        match ClientEvent::decode(raw).unwrap() {
            ClientEvent::JoinRoom(join) => assert_eq!(join.participant, ParticipantIdentity::default()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_null_activity_flag_means_active() {
        let raw = br#"{ "event": "user-activity", "data": { "documentId": null, "isActive": null } }"#;
        assert_eq!(
            ClientEvent::decode(raw).unwrap(),
            ClientEvent::UserActivity(UserActivity::default())
        );

        let list = br#"{ "event": "presence-update", "data": [{ "id": "u1", "name": null, "connectionId": null, "isActive": null }] }"#;
        match ServerEvent::decode(list).unwrap() {
            ServerEvent::PresenceUpdate(participants) => {
                assert_eq!(participants[0].id, "u1");
                assert!(participants[0].is_active);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
