//! Per-feature handlers for inbound client events.
//!
//! Every handler runs on an `Active` connection, after the per-event rate
//! limit. Frames that fail to parse are charged one unit before they are
//! rejected. Failures go back to the sender as an `error` event and never tear
//! the connection down.

pub mod chat;
pub mod presence;
pub mod rooms;
pub mod typing;
pub mod views;
pub mod watch_party;

use roomcast_common::Frame;
use serde_json::Value;

use super::events::ClientEvent;
use super::handler::send_error;
use super::presence::refresh;
use super::registry::ConnectionHandle;
use super::session::Session;
use super::Gateway;
use crate::error::GatewayError;

/// Handle one raw inbound text frame end to end.
pub async fn handle_text(gw: &Gateway, conn: &ConnectionHandle, session: &mut Session, text: &str) {
    handle_parsed(gw, conn, session, ClientEvent::parse(text)).await;
}

/// Same as [`handle_text`] for a frame that already arrived as JSON (the
/// polling transport accepts batches).
pub async fn handle_frame(gw: &Gateway, conn: &ConnectionHandle, session: &mut Session, frame: Value) {
    let parsed = serde_json::from_value::<Frame>(frame)
        .map_err(|e| GatewayError::validation(format!("malformed frame: {e}")))
        .and_then(ClientEvent::from_frame);
    handle_parsed(gw, conn, session, parsed).await;
}

async fn handle_parsed(
    gw: &Gateway,
    conn: &ConnectionHandle,
    session: &mut Session,
    parsed: Result<ClientEvent, GatewayError>,
) {
    if session.record_activity() {
        refresh(gw, conn).await;
    }
    if !session.is_active() {
        return;
    }

    let result = match parsed {
        Ok(event) => dispatch(gw, conn, event).await,
        // Frames that never parse still spend budget.
        Err(err) => match gw.event_limiter.check(conn.user_id(), 1) {
            Ok(()) => Err(err),
            Err(retry_after) => Err(GatewayError::RateLimited { retry_after }),
        },
    };
    if let Err(err) = result {
        tracing::debug!(connection_id = %conn.id, code = err.code(), error = %err, "event rejected");
        send_error(conn, &err);
    }
}

pub async fn dispatch(
    gw: &Gateway,
    conn: &ConnectionHandle,
    event: ClientEvent,
) -> Result<(), GatewayError> {
    gw.event_limiter
        .check(conn.user_id(), event.cost())
        .map_err(|retry_after| GatewayError::RateLimited { retry_after })?;

    tracing::trace!(connection_id = %conn.id, event = event.name(), "dispatching event");
    match event {
        ClientEvent::RoomJoin(req) => rooms::join(gw, conn, req).await,
        ClientEvent::RoomLeave(req) => rooms::leave(gw, conn, req).await,
        ClientEvent::TypingStart(req) => typing::relay(gw, conn, req, true),
        ClientEvent::TypingStop(req) => typing::relay(gw, conn, req, false),
        ClientEvent::ChatMessage(req) => chat::send(gw, conn, req).await,
        ClientEvent::WatchPartySync(req) => watch_party::sync(gw, conn, req).await,
        ClientEvent::PresenceUpdate(req) => presence::update(gw, conn, req).await,
        ClientEvent::PostView(req) => views::record(gw, req).await,
    }
}
