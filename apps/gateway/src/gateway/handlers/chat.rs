//! `chat:message`: persisted first, broadcast only once durable.

use roomcast_common::protocol::event;
use roomcast_common::RoomName;

use crate::error::GatewayError;
use crate::gateway::events::{self, ChatMessageNew, ChatRequest};
use crate::gateway::registry::ConnectionHandle;
use crate::gateway::Gateway;
use crate::services::bounded;
use crate::services::persistence::NewChatMessage;

pub fn validate_content(message: &str, max_chars: usize) -> Result<String, GatewayError> {
    let content = message.trim();
    if content.is_empty() {
        return Err(GatewayError::validation("message must not be empty"));
    }
    if content.chars().count() > max_chars {
        return Err(GatewayError::validation(format!(
            "message must be at most {max_chars} characters"
        )));
    }
    Ok(content.to_string())
}

pub async fn send(
    gw: &Gateway,
    conn: &ConnectionHandle,
    req: ChatRequest,
) -> Result<(), GatewayError> {
    let room = RoomName::chat(&req.room_id)
        .map_err(|e| GatewayError::validation(format!("invalid roomId: {e}")))?;
    let content = validate_content(&req.message, gw.settings.chat_max_chars)?;
    if !gw.registry.is_member(&conn.id, &room) {
        return Err(GatewayError::unauthorized(format!(
            "join {room} before sending messages to it"
        )));
    }

    let saved = bounded(
        gw.settings.upstream_timeout,
        "save chat message",
        gw.persistence.save_chat_message(NewChatMessage {
            room_id: req.room_id,
            author_id: conn.user_id().to_string(),
            content,
            reply_to_id: req.reply_to.filter(|r| !r.is_empty()),
        }),
    )
    .await?;

    tracing::debug!(connection_id = %conn.id, room = %room, message_id = %saved.id, "chat message stored");
    let payload = ChatMessageNew {
        message: &saved,
        author_name: &conn.principal.display_name,
    };
    gw.publish_to_room(room, event::CHAT_MESSAGE_NEW, events::to_value(&payload));
    Ok(())
}
