//! Presence announcements and the periodic staleness sweep.
//!
//! Everything here is best-effort: a failing presence store is logged and the
//! caller carries on.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use roomcast_common::protocol::event;
use roomcast_common::{RoomKind, RoomName};

use super::events::{self, OnlineCount, PostViewers, UserPresence};
use super::registry::ConnectionHandle;
use super::Gateway;

/// Re-assert the connection's personal room entry and refresh every entry
/// the identity holds.
pub async fn refresh(gw: &Gateway, conn: &ConnectionHandle) {
    let user_id = conn.user_id();
    let result = match RoomName::user(user_id) {
        Ok(personal) => gw.presence.join(user_id, &personal).await,
        Err(_) => Ok(()),
    };
    if let Err(e) = result.and(gw.presence.touch(user_id).await) {
        tracing::warn!(connection_id = %conn.id, user_id, error = %e, "presence refresh failed");
    }
}

pub async fn publish_online_count(gw: &Gateway) {
    match gw.presence.online_count().await {
        Ok(count) => gw.publish_to_everyone(event::ONLINE_COUNT, events::to_value(&OnlineCount { count })),
        Err(e) => tracing::warn!(error = %e, "failed to read online count"),
    }
}

/// Tell followers that `user_id` came online, and everyone the new count.
pub async fn announce_online(gw: &Gateway, user_id: &str) {
    if let Ok(activity) = RoomName::activity(user_id) {
        let status = gw.presence.get_status(user_id).await.ok().flatten();
        let payload = UserPresence {
            user_id,
            status: Some(status.as_deref().unwrap_or("online")),
            location: None,
            location_type: None,
        };
        gw.publish_to_room(activity, event::USER_ONLINE, events::to_value(&payload));
    }
    publish_online_count(gw).await;
}

pub async fn announce_offline(gw: &Gateway, user_id: &str) {
    if let Ok(activity) = RoomName::activity(user_id) {
        let payload = UserPresence {
            user_id,
            status: None,
            location: None,
            location_type: None,
        };
        gw.publish_to_room(activity, event::USER_OFFLINE, events::to_value(&payload));
    }
    publish_online_count(gw).await;
}

/// Clear the online flag and announce it if the identity was online.
pub async fn mark_offline(gw: &Gateway, user_id: &str) {
    match gw.presence.set_offline(user_id).await {
        Ok(true) => {
            tracing::debug!(user_id, "user went offline");
            announce_offline(gw, user_id).await;
        }
        Ok(false) => {}
        Err(e) => tracing::warn!(user_id, error = %e, "failed to mark user offline"),
    }
}

/// Publish the cluster-wide viewer list of a post room to its members.
pub async fn publish_post_viewers(gw: &Gateway, room: &RoomName) {
    if room.kind() != RoomKind::Post {
        return;
    }
    match gw.presence.list_room_members(room).await {
        Ok(viewers) => gw.publish_to_room(
            room.clone(),
            event::POST_VIEWERS,
            events::to_value(&PostViewers {
                room: room.clone(),
                viewers,
            }),
        ),
        Err(e) => tracing::warn!(room = %room, error = %e, "failed to list post viewers"),
    }
}

/// Count the connection into `room` and upsert the identity's entry.
pub async fn enter_room(gw: &Gateway, conn: &ConnectionHandle, room: &RoomName) {
    let user_id = conn.user_id();
    let result = match gw.presence.acquire_room(user_id, room).await {
        Ok(_) => gw.presence.join(user_id, room).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        tracing::warn!(room = %room, connection_id = %conn.id, error = %e, "presence join failed");
    }
}

/// Count the connection out of `room`. The identity's entry is removed, and
/// post viewers republished, only when no connection on any instance is
/// left in the room.
pub async fn exit_room(gw: &Gateway, conn: &ConnectionHandle, room: &RoomName) {
    let user_id = conn.user_id();
    let last = match gw.presence.release_room(user_id, room).await {
        Ok(remaining) => remaining == 0,
        Err(e) => {
            tracing::warn!(room = %room, user_id, error = %e, "failed to release room");
            !gw.registry.user_has_other_connection_in(user_id, room, &conn.id)
        }
    };
    if !last {
        return;
    }
    if let Err(e) = gw.presence.leave(user_id, room).await {
        tracing::warn!(room = %room, user_id, error = %e, "presence leave failed");
        return;
    }
    publish_post_viewers(gw, room).await;
}

/// Periodically purge stale presence entries. Identities left with no entry
/// at all are treated as offline.
pub async fn run_sweeper(gw: Arc<Gateway>) {
    let mut interval = tokio::time::interval(gw.settings.presence_sweep_interval);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = gw.shutdown_token().cancelled() => break,
            _ = interval.tick() => sweep_once(&gw).await,
        }
    }
    tracing::debug!("presence sweeper stopped");
}

pub async fn sweep_once(gw: &Gateway) {
    let swept = match gw.presence.sweep_stale(gw.settings.presence_max_age).await {
        Ok(swept) => swept,
        Err(e) => {
            tracing::warn!(error = %e, "presence sweep failed");
            return;
        }
    };
    if swept.is_empty() {
        return;
    }

    let mut by_identity: BTreeMap<&str, usize> = BTreeMap::new();
    let mut post_rooms: BTreeSet<&RoomName> = BTreeSet::new();
    for entry in &swept {
        *by_identity.entry(entry.identity_id.as_str()).or_default() += 1;
        if entry.room.kind() == RoomKind::Post {
            post_rooms.insert(&entry.room);
        }
    }
    tracing::info!(entries = swept.len(), identities = by_identity.len(), "swept stale presence");

    for room in post_rooms {
        publish_post_viewers(gw, room).await;
    }
    for identity_id in by_identity.keys() {
        match gw.presence.rooms_of(identity_id).await {
            Ok(rooms) if rooms.is_empty() => mark_offline(gw, identity_id).await,
            Ok(_) => {}
            Err(e) => tracing::warn!(identity_id, error = %e, "failed to read remaining presence"),
        }
    }
}
