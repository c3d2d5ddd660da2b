//! Typed events in both directions, validated at the boundary.

use std::sync::Arc;

use roomcast_common::protocol::event;
use roomcast_common::{Frame, RoomName};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::services::identity::Principal;
use crate::services::persistence::ChatMessage;

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRequest {
    /// Full room name (`post:42`) or bare id combined with `room_type`.
    pub room: String,
    #[serde(default)]
    pub room_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TypingRequest {
    pub room: RoomName,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub room_id: String,
    pub message: String,
    #[serde(default)]
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchPartySyncRequest {
    pub party_id: String,
    pub current_time: f64,
    pub is_playing: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdateRequest {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub location_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostViewRequest {
    pub post_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ClientEvent {
    #[serde(rename = "room:join")]
    RoomJoin(RoomRequest),
    #[serde(rename = "room:leave")]
    RoomLeave(RoomRequest),
    #[serde(rename = "comment:typing:start")]
    TypingStart(TypingRequest),
    #[serde(rename = "comment:typing:stop")]
    TypingStop(TypingRequest),
    #[serde(rename = "chat:message")]
    ChatMessage(ChatRequest),
    #[serde(rename = "watchParty:sync")]
    WatchPartySync(WatchPartySyncRequest),
    #[serde(rename = "presence:update")]
    PresenceUpdate(PresenceUpdateRequest),
    #[serde(rename = "post:view")]
    PostView(PostViewRequest),
}

const CLIENT_EVENTS: &[&str] = &[
    event::ROOM_JOIN,
    event::ROOM_LEAVE,
    event::COMMENT_TYPING_START,
    event::COMMENT_TYPING_STOP,
    event::CHAT_MESSAGE,
    event::WATCH_PARTY_SYNC,
    event::PRESENCE_UPDATE,
    event::POST_VIEW,
];

impl ClientEvent {
    /// Parse one inbound frame. Unknown events and malformed payloads are
    /// both `ValidationFailed`, with a message telling them apart.
    pub fn parse(text: &str) -> Result<Self, GatewayError> {
        let frame: Frame = serde_json::from_str(text)
            .map_err(|_| GatewayError::validation("frame is not a valid {event, payload} object"))?;
        Self::from_frame(frame)
    }

    pub fn from_frame(frame: Frame) -> Result<Self, GatewayError> {
        if !CLIENT_EVENTS.contains(&frame.event.as_str()) {
            return Err(GatewayError::validation(format!(
                "unknown event `{}`",
                frame.event
            )));
        }
        let name = frame.event.clone();
        serde_json::from_value(serde_json::json!({
            "event": frame.event,
            "payload": frame.payload,
        }))
        .map_err(|e| GatewayError::validation(format!("invalid `{name}` payload: {e}")))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::RoomJoin(_) => event::ROOM_JOIN,
            ClientEvent::RoomLeave(_) => event::ROOM_LEAVE,
            ClientEvent::TypingStart(_) => event::COMMENT_TYPING_START,
            ClientEvent::TypingStop(_) => event::COMMENT_TYPING_STOP,
            ClientEvent::ChatMessage(_) => event::CHAT_MESSAGE,
            ClientEvent::WatchPartySync(_) => event::WATCH_PARTY_SYNC,
            ClientEvent::PresenceUpdate(_) => event::PRESENCE_UPDATE,
            ClientEvent::PostView(_) => event::POST_VIEW,
        }
    }

    /// Units charged against the per-event rate limit.
    pub fn cost(&self) -> u32 {
        match self {
            // Each one costs a durable write upstream.
            ClientEvent::ChatMessage(_) => 2,
            _ => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// Serialize `{event, payload}` once so every recipient shares the same bytes.
pub fn encode(event: &str, payload: Value) -> Arc<str> {
    let frame = Frame::new(event, payload);
    match serde_json::to_string(&frame) {
        Ok(json) => Arc::from(json),
        // A `Value` always serializes.
        Err(_) => Arc::from(r#"{"event":"error","payload":{}}"#),
    }
}

pub fn to_value<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connected<'a> {
    pub connection_id: &'a str,
    pub instance_id: &'a str,
    pub user: &'a Principal,
    pub online_friends: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RoomJoined {
    pub room: RoomName,
    pub members: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RoomLeft {
    pub room: RoomName,
}

#[derive(Debug, Serialize)]
pub struct PostViewers {
    pub room: RoomName,
    pub viewers: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Typing<'a> {
    pub user_id: &'a str,
    pub username: &'a str,
    pub is_typing: bool,
    pub room: &'a RoomName,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageNew<'a> {
    #[serde(flatten)]
    pub message: &'a ChatMessage,
    pub author_name: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchPartySyncUpdate<'a> {
    pub party_id: &'a str,
    pub current_time: f64,
    pub is_playing: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence<'a> {
    pub user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_type: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct OnlineCount {
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_room_join_with_type() {
        let ev = ClientEvent::parse(r#"{"event":"room:join","payload":{"room":"42","roomType":"post"}}"#)
            .unwrap();
        assert_eq!(
            ev,
            ClientEvent::RoomJoin(RoomRequest {
                room: "42".into(),
                room_type: Some("post".into()),
            })
        );
        assert_eq!(ev.name(), "room:join");
    }

    #[test]
    fn parses_typing_with_full_room_name() {
        let ev = ClientEvent::parse(r#"{"event":"comment:typing:start","payload":{"room":"post:42"}}"#)
            .unwrap();
        match ev {
            ClientEvent::TypingStart(req) => assert_eq!(req.room.to_string(), "post:42"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_event_is_a_validation_error() {
        let err = ClientEvent::parse(r#"{"event":"shout","payload":{}}"#).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");
        assert!(err.to_string().contains("unknown event"));
    }

    #[test]
    fn malformed_payload_is_a_validation_error() {
        let err = ClientEvent::parse(r#"{"event":"watchParty:sync","payload":{"partyId":"p1"}}"#)
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");
        assert!(err.to_string().contains("watchParty:sync"));

        let err = ClientEvent::parse("not json").unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");

        let err = ClientEvent::parse(r#"{"event":"comment:typing:stop","payload":{"room":"nope:1"}}"#)
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");
    }

    #[test]
    fn chat_costs_more_than_typing() {
        let chat = ClientEvent::parse(r#"{"event":"chat:message","payload":{"roomId":"c1","message":"hi"}}"#)
            .unwrap();
        let typing = ClientEvent::parse(r#"{"event":"comment:typing:stop","payload":{"room":"post:1"}}"#)
            .unwrap();
        assert!(chat.cost() > typing.cost());
    }

    #[test]
    fn encoded_frames_are_event_payload_objects() {
        let frame = encode("online:count", to_value(&OnlineCount { count: 3 }));
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["event"], "online:count");
        assert_eq!(v["payload"]["count"], 3);
    }
}
