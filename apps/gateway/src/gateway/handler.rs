//! Connection lifecycle shared by every transport: authenticate, activate,
//! close.

use std::sync::Arc;

use tokio::sync::mpsc;

use roomcast_common::id::{prefix, prefixed_ulid};
use roomcast_common::protocol::{close_code, event};
use roomcast_common::{RoomKind, RoomName};

use super::events::{self, Connected};
use super::presence;
use super::registry::{ConnectionHandle, Transport};
use super::session::{ConnectionState, Session};
use super::Gateway;
use crate::error::GatewayError;
use crate::services::bounded;
use crate::services::identity::Principal;

/// Close code sent when a connection attempt fails with `err`.
pub fn close_code_for(err: &GatewayError) -> u16 {
    match err {
        GatewayError::AuthFailed(_) => close_code::AUTH_FAILED,
        GatewayError::Banned => close_code::BANNED,
        GatewayError::RateLimited { .. } => close_code::RATE_LIMITED,
        // Retryable: the client should come back once upstream recovers.
        _ => 1011,
    }
}

/// Short reason sent in the close frame.
pub fn close_reason_for(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::AuthFailed(_) => "auth_failed",
        GatewayError::Banned => "banned",
        GatewayError::RateLimited { .. } => "rate_limited",
        _ => "upstream_unavailable",
    }
}

/// Resolve the credential into a principal and charge the connection budget.
pub async fn authenticate(
    gw: &Gateway,
    credential: Option<&str>,
) -> Result<Principal, GatewayError> {
    let credential = credential
        .filter(|c| !c.is_empty())
        .ok_or_else(|| GatewayError::AuthFailed("missing credential".into()))?;

    let principal = bounded(
        gw.settings.upstream_timeout,
        "identity validate",
        gw.identity.validate(credential),
    )
    .await?
    .ok_or_else(|| GatewayError::AuthFailed("invalid or expired credential".into()))?;

    if principal.banned {
        return Err(GatewayError::Banned);
    }
    if RoomName::user(&principal.id).is_err() {
        tracing::warn!(user_id = %principal.id, "principal id is not addressable as a room");
        return Err(GatewayError::AuthFailed("unsupported principal id".into()));
    }

    gw.connect_limiter
        .check(&principal.id, 1)
        .map_err(|retry_after| GatewayError::RateLimited { retry_after })?;

    Ok(principal)
}

/// An authenticated connection ready to be served by its transport.
pub struct OpenConnection {
    pub handle: ConnectionHandle,
    pub outbound: mpsc::Receiver<Arc<str>>,
    pub session: Session,
}

/// Run `Connecting -> Authenticating -> Active` for a new transport.
///
/// On failure the session is already `Closed` and the caller only has to
/// tell the client why.
pub async fn open(
    gw: &Gateway,
    credential: Option<&str>,
    transport: Transport,
) -> Result<OpenConnection, GatewayError> {
    let connection_id = prefixed_ulid(prefix::CONNECTION);
    let mut session = Session::new(connection_id.clone(), gw.settings.presence_refresh_interval);
    session.transition(ConnectionState::Authenticating);

    let principal = match authenticate(gw, credential).await {
        Ok(p) => p,
        Err(err) => {
            tracing::info!(
                connection_id = %connection_id,
                transport = transport.as_str(),
                code = err.code(),
                "connection rejected"
            );
            session.transition(ConnectionState::Closing);
            session.transition(ConnectionState::Closed);
            return Err(err);
        }
    };

    let (handle, outbound) = activate(gw, connection_id, principal, transport).await;
    session.transition(ConnectionState::Active);
    Ok(OpenConnection {
        handle,
        outbound,
        session,
    })
}

async fn activate(
    gw: &Gateway,
    connection_id: String,
    principal: Principal,
    transport: Transport,
) -> (ConnectionHandle, mpsc::Receiver<Arc<str>>) {
    let principal = Arc::new(principal);
    let user_id = principal.id.clone();
    let (handle, outbound) = ConnectionHandle::new(
        connection_id,
        principal,
        transport,
        gw.settings.outbound_buffer,
        gw.shutdown_token(),
    );
    gw.registry.register(handle.clone());

    if let Ok(personal) = RoomName::user(&user_id) {
        gw.registry.add(&handle.id, &personal);
        if let Err(e) = gw.presence.join(&user_id, &personal).await {
            tracing::warn!(user_id = %user_id, error = %e, "failed to record personal room presence");
        }
    }

    if let Err(e) = gw.presence.acquire_connection(&user_id).await {
        tracing::warn!(user_id = %user_id, error = %e, "failed to count connection");
    }
    match gw.presence.set_online(&user_id).await {
        Ok(true) => presence::announce_online(gw, &user_id).await,
        Ok(false) => {}
        Err(e) => tracing::warn!(user_id = %user_id, error = %e, "failed to mark user online"),
    }

    let online_friends = follow_activity(gw, &handle).await;

    let connected = Connected {
        connection_id: &handle.id,
        instance_id: &gw.instance_id,
        user: &handle.principal,
        online_friends,
    };
    handle.push(events::encode(event::CONNECTED, events::to_value(&connected)));

    tracing::info!(
        connection_id = %handle.id,
        user_id = %user_id,
        transport = transport.as_str(),
        "connection active"
    );
    (handle, outbound)
}

/// Join the activity rooms of everyone the user follows, bounded by the
/// fan-in limit. Returns the followed users that are online right now.
///
/// Best-effort: upstream failures are logged and yield an empty list.
async fn follow_activity(gw: &Gateway, conn: &ConnectionHandle) -> Vec<String> {
    let followed = match bounded(
        gw.settings.upstream_timeout,
        "get followed ids",
        gw.persistence.get_followed_ids(conn.user_id()),
    )
    .await
    {
        Ok(ids) => ids,
        Err(e) => {
            tracing::warn!(connection_id = %conn.id, error = %e, "could not load follows");
            return Vec::new();
        }
    };

    let limit = gw.settings.follow_fanin_limit;
    if followed.len() > limit {
        tracing::debug!(
            connection_id = %conn.id,
            follows = followed.len(),
            limit,
            "follow list truncated"
        );
    }
    let followed: Vec<String> = followed.into_iter().take(limit).collect();
    for id in &followed {
        if let Ok(room) = RoomName::activity(id) {
            gw.registry.add(&conn.id, &room);
        }
    }

    match gw.presence.filter_online(&followed).await {
        Ok(online) => online,
        Err(e) => {
            tracing::warn!(connection_id = %conn.id, error = %e, "could not resolve online friends");
            Vec::new()
        }
    }
}

/// Run `Active -> Closing -> Closed`: leave every room, release presence and
/// announce the user offline once their last connection anywhere is gone.
pub async fn close(gw: &Gateway, conn: &ConnectionHandle, session: &mut Session) {
    session.transition(ConnectionState::Closing);
    let user_id = conn.user_id();
    let rooms = gw.registry.drop_all(&conn.id);

    // Connections of this user held anywhere in the cluster, this one excluded.
    let remaining = match gw.presence.release_connection(user_id).await {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!(user_id, error = %e, "failed to release connection");
            None
        }
    };

    for room in &rooms {
        if room.subscope().is_some() {
            // Activity subscriptions hold no presence entry.
            continue;
        }
        if room.kind() != RoomKind::User {
            presence::exit_room(gw, conn, room).await;
            continue;
        }
        // The personal room entry belongs to every connection of the user.
        if remaining != Some(0) {
            continue;
        }
        if let Err(e) = gw.presence.leave(user_id, room).await {
            tracing::warn!(room = %room, user_id, error = %e, "failed to leave presence room");
        }
    }

    if remaining == Some(0) {
        presence::mark_offline(gw, user_id).await;
    }

    session.transition(ConnectionState::Closed);
    tracing::info!(
        connection_id = %conn.id,
        user_id,
        rooms = rooms.len(),
        reason = ?conn.close_reason(),
        "connection closed"
    );
}

/// Report a handler failure to the originating connection only.
pub fn send_error(conn: &ConnectionHandle, err: &GatewayError) {
    conn.push(events::encode(event::ERROR, err.to_payload()));
}
