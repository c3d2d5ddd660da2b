//! Outward API used by the request/response side of the product to push
//! notifications into connected clients without knowing where they are.

use serde_json::Value;

use roomcast_common::RoomName;

use super::Gateway;
use crate::bus::{BusMessage, DisconnectReason};
use crate::error::GatewayError;
use crate::store::{now_ms, WatchPartyState};

impl Gateway {
    /// Deliver to every connection of `user_id`, on every instance.
    pub fn emit_to_user(&self, user_id: &str, event: &str, payload: Value) -> Result<(), GatewayError> {
        let room = RoomName::user(user_id)
            .map_err(|e| GatewayError::validation(format!("invalid user id: {e}")))?;
        self.publish_to_room(room, event, payload);
        Ok(())
    }

    pub fn emit_to_room(&self, room: RoomName, event: &str, payload: Value) {
        self.publish_to_room(room, event, payload);
    }

    /// Deliver to every connection on every instance.
    pub fn broadcast(&self, event: &str, payload: Value) {
        self.publish_to_everyone(event, payload);
    }

    /// Close every connection of `user_id`, wherever it is held.
    pub fn disconnect_user(&self, user_id: &str, reason: DisconnectReason) {
        tracing::info!(user_id, reason = reason.as_str(), "disconnecting user");
        self.bus
            .publish(BusMessage::disconnect(&self.instance_id, user_id, reason));
    }

    /// Create the shared state for a watch party hosted by `host_id`.
    ///
    /// Returns the state now held and whether this call created it. An
    /// existing party is left untouched.
    pub async fn open_watch_party(
        &self,
        party_id: &str,
        host_id: &str,
    ) -> Result<(WatchPartyState, bool), GatewayError> {
        RoomName::watch_party(party_id)
            .map_err(|e| GatewayError::validation(format!("invalid party id: {e}")))?;
        if host_id.is_empty() {
            return Err(GatewayError::validation("hostId must not be empty"));
        }

        let state = WatchPartyState {
            party_id: party_id.to_string(),
            current_time: 0.0,
            is_playing: false,
            host_id: host_id.to_string(),
            last_sync_at: now_ms(),
        };
        if self.parties.create_party(&state).await? {
            tracing::info!(party_id, host_id, "watch party opened");
            return Ok((state, true));
        }

        let existing = self
            .parties
            .get_party(party_id)
            .await?
            .ok_or_else(|| GatewayError::not_found(format!("watch party {party_id} does not exist")))?;
        Ok((existing, false))
    }
}
