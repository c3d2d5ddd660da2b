//! Room name grammar: `{kind}:{id}[:{subscope}]`.
//!
//! A room name is both the key of a local fan-out bucket and the topic a
//! gateway instance publishes to on the broadcast bus.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Longest id or subscope segment accepted in a room name.
pub const MAX_SEGMENT_LEN: usize = 128;

/// Subscope used for the per-user activity room followers subscribe to.
pub const ACTIVITY_SUBSCOPE: &str = "activity";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoomKind {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "post")]
    Post,
    #[serde(rename = "chat")]
    Chat,
    #[serde(rename = "watchParty")]
    WatchParty,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::User => "user",
            RoomKind::Post => "post",
            RoomKind::Chat => "chat",
            RoomKind::WatchParty => "watchParty",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(RoomKind::User),
            "post" => Some(RoomKind::Post),
            "chat" => Some(RoomKind::Chat),
            "watchParty" => Some(RoomKind::WatchParty),
            _ => None,
        }
    }
}

impl fmt::Display for RoomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomNameError {
    #[error("room name is empty")]
    Empty,
    #[error("unknown room kind `{0}`")]
    UnknownKind(String),
    #[error("room id is missing")]
    MissingId,
    #[error("room name has too many segments")]
    TooManySegments,
    #[error("invalid room segment `{0}`")]
    InvalidSegment(String),
}

/// A validated room name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomName {
    kind: RoomKind,
    id: String,
    subscope: Option<String>,
}

impl RoomName {
    pub fn new(kind: RoomKind, id: &str) -> Result<Self, RoomNameError> {
        validate_segment(id)?;
        Ok(Self {
            kind,
            id: id.to_string(),
            subscope: None,
        })
    }

    pub fn with_subscope(mut self, subscope: &str) -> Result<Self, RoomNameError> {
        validate_segment(subscope)?;
        self.subscope = Some(subscope.to_string());
        Ok(self)
    }

    /// Personal room of a user: `user:{id}`.
    pub fn user(user_id: &str) -> Result<Self, RoomNameError> {
        Self::new(RoomKind::User, user_id)
    }

    /// Activity room followers of a user subscribe to: `user:{id}:activity`.
    pub fn activity(user_id: &str) -> Result<Self, RoomNameError> {
        Self::new(RoomKind::User, user_id)?.with_subscope(ACTIVITY_SUBSCOPE)
    }

    pub fn post(post_id: &str) -> Result<Self, RoomNameError> {
        Self::new(RoomKind::Post, post_id)
    }

    pub fn chat(room_id: &str) -> Result<Self, RoomNameError> {
        Self::new(RoomKind::Chat, room_id)
    }

    pub fn watch_party(party_id: &str) -> Result<Self, RoomNameError> {
        Self::new(RoomKind::WatchParty, party_id)
    }

    pub fn kind(&self) -> RoomKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscope(&self) -> Option<&str> {
        self.subscope.as_deref()
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)?;
        if let Some(sub) = &self.subscope {
            write!(f, ":{sub}")?;
        }
        Ok(())
    }
}

impl FromStr for RoomName {
    type Err = RoomNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(RoomNameError::Empty);
        }
        let mut parts = s.split(':');
        let kind_str = parts.next().unwrap_or_default();
        let kind =
            RoomKind::parse(kind_str).ok_or_else(|| RoomNameError::UnknownKind(kind_str.to_string()))?;
        let id = parts.next().ok_or(RoomNameError::MissingId)?;
        let mut room = RoomName::new(kind, id)?;
        if let Some(sub) = parts.next() {
            room = room.with_subscope(sub)?;
        }
        if parts.next().is_some() {
            return Err(RoomNameError::TooManySegments);
        }
        Ok(room)
    }
}

impl TryFrom<String> for RoomName {
    type Error = RoomNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RoomName> for String {
    fn from(room: RoomName) -> Self {
        room.to_string()
    }
}

fn validate_segment(segment: &str) -> Result<(), RoomNameError> {
    if segment.is_empty() {
        return Err(RoomNameError::MissingId);
    }
    let ok = segment.len() <= MAX_SEGMENT_LEN
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(RoomNameError::InvalidSegment(segment.to_string()))
    }
}
