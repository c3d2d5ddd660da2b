//! `comment:typing:start` / `comment:typing:stop`: relayed, never stored.
//!
//! Typing indicators belong to comment threads, so only plain post rooms
//! accept them.

use roomcast_common::protocol::event;
use roomcast_common::RoomKind;

use crate::error::GatewayError;
use crate::gateway::events::{self, Typing, TypingRequest};
use crate::gateway::registry::ConnectionHandle;
use crate::gateway::Gateway;

pub fn relay(
    gw: &Gateway,
    conn: &ConnectionHandle,
    req: TypingRequest,
    is_typing: bool,
) -> Result<(), GatewayError> {
    if req.room.kind() != RoomKind::Post || req.room.subscope().is_some() {
        return Err(GatewayError::validation(format!(
            "typing is only relayed in post rooms, not {}",
            req.room
        )));
    }
    if !gw.registry.is_member(&conn.id, &req.room) {
        return Err(GatewayError::unauthorized(format!(
            "join {} before typing in it",
            req.room
        )));
    }

    let payload = Typing {
        user_id: conn.user_id(),
        username: &conn.principal.display_name,
        is_typing,
        room: &req.room,
    };
    gw.publish_to_room_except(
        req.room.clone(),
        event::COMMENT_TYPING,
        events::to_value(&payload),
        &conn.id,
    );
    Ok(())
}
