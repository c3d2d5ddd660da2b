//! Publish/subscribe fabric connecting the room registries of all instances.
//!
//! Publishing is fire-and-forget: it never waits on the network and a message
//! may be lost if the backend is unreachable. Every instance runs exactly one
//! dispatcher over [`BroadcastBus::subscribe`].

pub mod local;
pub mod redis;

use std::sync::Arc;

use roomcast_common::RoomName;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use utoipa::ToSchema;

pub use self::local::LocalBus;
pub use self::redis::RedisBus;

/// Capacity of the in-process delivery channel. Dispatchers that fall behind
/// skip messages (`RecvError::Lagged`).
pub const BUS_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectReason {
    /// Terminal: clients must not retry.
    Kick,
    /// Clients are expected to reconnect, possibly to another instance.
    Reconnect,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Kick => "kick",
            DisconnectReason::Reconnect => "reconnect",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BusPayload {
    /// Deliver to every local member of `room`, except `exclude` if set.
    #[serde(rename_all = "camelCase")]
    Room {
        room: RoomName,
        event: String,
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exclude: Option<String>,
    },
    /// Deliver to every connection on every instance.
    Everyone { event: String, payload: Value },
    /// Close every connection of `user_id`.
    #[serde(rename_all = "camelCase")]
    Disconnect {
        user_id: String,
        reason: DisconnectReason,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Instance that published the message.
    pub origin: String,
    #[serde(flatten)]
    pub payload: BusPayload,
}

impl BusMessage {
    pub fn room(origin: &str, room: RoomName, event: &str, payload: Value) -> Self {
        Self {
            origin: origin.to_string(),
            payload: BusPayload::Room {
                room,
                event: event.to_string(),
                payload,
                exclude: None,
            },
        }
    }

    /// Skip one connection when delivering (the sender of a non-echoed event).
    pub fn excluding(mut self, connection_id: &str) -> Self {
        if let BusPayload::Room { exclude, .. } = &mut self.payload {
            *exclude = Some(connection_id.to_string());
        }
        self
    }

    pub fn everyone(origin: &str, event: &str, payload: Value) -> Self {
        Self {
            origin: origin.to_string(),
            payload: BusPayload::Everyone {
                event: event.to_string(),
                payload,
            },
        }
    }

    pub fn disconnect(origin: &str, user_id: &str, reason: DisconnectReason) -> Self {
        Self {
            origin: origin.to_string(),
            payload: BusPayload::Disconnect {
                user_id: user_id.to_string(),
                reason,
            },
        }
    }
}

pub trait BroadcastBus: Send + Sync {
    /// Queue `message` for delivery to every instance, this one included.
    fn publish(&self, message: BusMessage);

    /// Stream of every message published by any instance.
    fn subscribe(&self) -> broadcast::Receiver<Arc<BusMessage>>;
}
