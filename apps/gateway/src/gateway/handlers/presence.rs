//! `presence:update`: status and location, announced to followers.

use roomcast_common::protocol::event;
use roomcast_common::RoomName;

use crate::error::GatewayError;
use crate::gateway::events::{self, PresenceUpdateRequest, UserPresence};
use crate::gateway::registry::ConnectionHandle;
use crate::gateway::Gateway;

pub const STATUSES: &[&str] = &["online", "idle", "dnd"];

const MAX_LOCATION_LEN: usize = 256;

pub async fn update(
    gw: &Gateway,
    conn: &ConnectionHandle,
    req: PresenceUpdateRequest,
) -> Result<(), GatewayError> {
    if let Some(status) = req.status.as_deref() {
        if !STATUSES.contains(&status) {
            return Err(GatewayError::validation(format!(
                "status must be one of {}",
                STATUSES.join(", ")
            )));
        }
    }
    if req
        .location
        .as_deref()
        .is_some_and(|l| l.len() > MAX_LOCATION_LEN)
    {
        return Err(GatewayError::validation("location is too long"));
    }

    let user_id = conn.user_id();
    if let Some(status) = req.status.as_deref() {
        gw.presence.set_status(user_id, status).await?;
    }

    let activity = RoomName::activity(user_id)
        .map_err(|_| GatewayError::validation("user cannot publish presence"))?;
    let payload = UserPresence {
        user_id,
        status: req.status.as_deref(),
        location: req.location.as_deref(),
        location_type: req.location_type.as_deref(),
    };
    gw.publish_to_room(activity, event::PRESENCE_UPDATE, events::to_value(&payload));
    Ok(())
}
