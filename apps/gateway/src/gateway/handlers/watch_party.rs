//! `watchParty:sync`: host-only writes to the shared playback state.

use roomcast_common::protocol::event;
use roomcast_common::RoomName;

use crate::error::GatewayError;
use crate::gateway::events::{self, WatchPartySyncRequest, WatchPartySyncUpdate};
use crate::gateway::registry::ConnectionHandle;
use crate::gateway::Gateway;
use crate::store::{now_ms, WatchPartyState};

pub async fn load(gw: &Gateway, party_id: &str) -> Result<WatchPartyState, GatewayError> {
    gw.parties
        .get_party(party_id)
        .await?
        .ok_or_else(|| GatewayError::not_found(format!("watch party {party_id} does not exist")))
}

pub async fn sync(
    gw: &Gateway,
    conn: &ConnectionHandle,
    req: WatchPartySyncRequest,
) -> Result<(), GatewayError> {
    if !req.current_time.is_finite() || req.current_time < 0.0 {
        return Err(GatewayError::validation("currentTime must be a non-negative number"));
    }
    let room = RoomName::watch_party(&req.party_id)
        .map_err(|e| GatewayError::validation(format!("invalid partyId: {e}")))?;

    let party = load(gw, &req.party_id).await?;
    if party.host_id != conn.user_id() {
        return Err(GatewayError::unauthorized("only the host can sync playback"));
    }

    let state = gw
        .parties
        .write_sync(&req.party_id, req.current_time, req.is_playing, now_ms())
        .await?
        .ok_or_else(|| GatewayError::not_found(format!("watch party {} does not exist", req.party_id)))?;

    let update = WatchPartySyncUpdate {
        party_id: &state.party_id,
        current_time: state.current_time,
        is_playing: state.is_playing,
    };
    gw.publish_to_room_except(
        room,
        event::WATCH_PARTY_SYNC_UPDATE,
        events::to_value(&update),
        &conn.id,
    );
    Ok(())
}
