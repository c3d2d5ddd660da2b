//! `room:join` / `room:leave`.

use roomcast_common::protocol::event;
use roomcast_common::{RoomKind, RoomName};

use super::watch_party;
use crate::error::GatewayError;
use crate::gateway::events::{self, RoomJoined, RoomLeft, RoomRequest};
use crate::gateway::presence::{enter_room, exit_room, publish_post_viewers};
use crate::gateway::registry::ConnectionHandle;
use crate::gateway::Gateway;

/// Room kinds a client may join by itself. Personal and activity rooms are
/// managed by the gateway.
const JOINABLE: &[RoomKind] = &[RoomKind::Post, RoomKind::Chat, RoomKind::WatchParty];

/// Accept `post:42`, or `42` together with `roomType: "post"`.
pub fn resolve_room(room: &str, room_type: Option<&str>) -> Result<RoomName, GatewayError> {
    let name = if room.contains(':') {
        let name: RoomName = room
            .parse()
            .map_err(|e| GatewayError::validation(format!("invalid room: {e}")))?;
        if let Some(kind) = room_type {
            if kind != name.kind().as_str() {
                return Err(GatewayError::validation(format!(
                    "room type `{kind}` does not match room `{name}`"
                )));
            }
        }
        name
    } else {
        let kind = room_type
            .ok_or_else(|| GatewayError::validation("roomType is required with a bare room id"))?;
        let kind = RoomKind::parse(kind)
            .ok_or_else(|| GatewayError::validation(format!("unknown room type `{kind}`")))?;
        RoomName::new(kind, room).map_err(|e| GatewayError::validation(format!("invalid room: {e}")))?
    };

    if !JOINABLE.contains(&name.kind()) || name.subscope().is_some() {
        return Err(GatewayError::validation(format!(
            "room type `{}` cannot be joined",
            name.kind()
        )));
    }
    Ok(name)
}

pub async fn join(
    gw: &Gateway,
    conn: &ConnectionHandle,
    req: RoomRequest,
) -> Result<(), GatewayError> {
    let room = resolve_room(&req.room, req.room_type.as_deref())?;

    // Registered before the snapshot is read, so a sync racing the join is
    // delivered rather than lost.
    let newly_added = gw.registry.add(&conn.id, &room);
    let party = if room.kind() == RoomKind::WatchParty {
        match watch_party::load(gw, room.id()).await {
            Ok(party) => Some(party),
            Err(e) => {
                if newly_added {
                    gw.registry.remove(&conn.id, &room);
                }
                return Err(e);
            }
        }
    } else {
        None
    };
    if newly_added {
        enter_room(gw, conn, &room).await;
    } else if let Err(e) = gw.presence.join(conn.user_id(), &room).await {
        tracing::warn!(room = %room, connection_id = %conn.id, error = %e, "presence join failed");
    }

    let members = gw.registry.local_member_ids(&room);
    conn.push(events::encode(
        event::ROOM_JOINED,
        events::to_value(&RoomJoined {
            room: room.clone(),
            members,
        }),
    ));
    if let Some(party) = party {
        conn.push(events::encode(event::WATCH_PARTY_STATE, events::to_value(&party)));
    }

    publish_post_viewers(gw, &room).await;
    tracing::debug!(connection_id = %conn.id, room = %room, "joined room");
    Ok(())
}

pub async fn leave(
    gw: &Gateway,
    conn: &ConnectionHandle,
    req: RoomRequest,
) -> Result<(), GatewayError> {
    let room = resolve_room(&req.room, req.room_type.as_deref())?;

    if gw.registry.remove(&conn.id, &room) {
        exit_room(gw, conn, &room).await;
    }

    conn.push(events::encode(
        event::ROOM_LEFT,
        events::to_value(&RoomLeft { room }),
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_full_and_bare_names() {
        assert_eq!(resolve_room("post:42", None).unwrap().to_string(), "post:42");
        assert_eq!(
            resolve_room("42", Some("post")).unwrap().to_string(),
            "post:42"
        );
        assert_eq!(
            resolve_room("p1", Some("watchParty")).unwrap().to_string(),
            "watchParty:p1"
        );
        assert_eq!(
            resolve_room("chat:c1", Some("chat")).unwrap().to_string(),
            "chat:c1"
        );
    }

    #[test]
    fn rejects_gateway_managed_and_mismatched_rooms() {
        let err = resolve_room("user:usr_2", None).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");
        assert!(resolve_room("user:usr_2:activity", None).is_err());
        assert!(resolve_room("post:42", Some("chat")).is_err());
        assert!(resolve_room("42", None).is_err());
        assert!(resolve_room("42", Some("group")).is_err());
        assert!(resolve_room("post:4 2", None).is_err());
    }
}
