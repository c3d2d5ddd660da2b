//! Wire frame shared by the gateway and its clients.
//!
//! Every message in either direction is a JSON object `{event, payload}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// Event names used on the wire.
pub mod event {
    // Client → server
    pub const ROOM_JOIN: &str = "room:join";
    pub const ROOM_LEAVE: &str = "room:leave";
    pub const COMMENT_TYPING_START: &str = "comment:typing:start";
    pub const COMMENT_TYPING_STOP: &str = "comment:typing:stop";
    pub const CHAT_MESSAGE: &str = "chat:message";
    pub const WATCH_PARTY_SYNC: &str = "watchParty:sync";
    pub const PRESENCE_UPDATE: &str = "presence:update";
    pub const POST_VIEW: &str = "post:view";

    // Server → client
    pub const CONNECTED: &str = "connected";
    pub const ROOM_JOINED: &str = "room:joined";
    pub const ROOM_LEFT: &str = "room:left";
    pub const POST_VIEWERS: &str = "post:viewers";
    pub const COMMENT_TYPING: &str = "comment:typing";
    pub const CHAT_MESSAGE_NEW: &str = "chat:message:new";
    pub const WATCH_PARTY_STATE: &str = "watchParty:state";
    pub const WATCH_PARTY_SYNC_UPDATE: &str = "watchParty:sync:update";
    pub const USER_ONLINE: &str = "user:online";
    pub const USER_OFFLINE: &str = "user:offline";
    pub const ONLINE_COUNT: &str = "online:count";
    pub const ERROR: &str = "error";
}

/// WebSocket close codes (4000-range for application-level).
pub mod close_code {
    pub const AUTH_FAILED: u16 = 4001;
    pub const BANNED: u16 = 4003;
    pub const IDLE_TIMEOUT: u16 = 4008;
    pub const KICKED: u16 = 4010;
    pub const RECONNECT: u16 = 4012;
    pub const RATE_LIMITED: u16 = 4029;

    /// Whether a client should try again after being closed with `code`.
    pub fn is_retryable(code: u16) -> bool {
        !matches!(code, AUTH_FAILED | BANNED | KICKED)
    }
}
