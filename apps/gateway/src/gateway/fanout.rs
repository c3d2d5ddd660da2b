//! Delivers bus messages to the connections held by this instance.
//!
//! One dispatcher runs per instance. It never waits on a client: frames are
//! queued with `try_send` and a connection that stopped reading loses frames
//! without slowing anyone else down.

use std::sync::Arc;

use tokio::sync::broadcast;

use roomcast_common::protocol::close_code;

use super::events;
use super::Gateway;
use crate::bus::{BusMessage, BusPayload, DisconnectReason};

pub async fn run_dispatcher(gw: Arc<Gateway>, mut rx: broadcast::Receiver<Arc<BusMessage>>) {
    loop {
        let result = tokio::select! {
            _ = gw.shutdown_token().cancelled() => break,
            result = rx.recv() => result,
        };

        match result {
            Ok(message) => {
                deliver(&gw, &message);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(
                    instance_id = %gw.instance_id,
                    skipped = n,
                    "dispatcher lagged behind the bus"
                );
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    tracing::debug!("dispatcher stopped");
}

/// Push one bus message to every matching local connection.
pub fn deliver(gw: &Gateway, message: &BusMessage) -> usize {
    match &message.payload {
        BusPayload::Room {
            room,
            event,
            payload,
            exclude,
        } => {
            let members = gw.registry.local_members(room);
            if members.is_empty() {
                return 0;
            }
            let frame = events::encode(event, payload.clone());
            members
                .iter()
                .filter(|conn| exclude.as_deref() != Some(conn.id.as_str()))
                .filter(|conn| conn.push(frame.clone()))
                .count()
        }
        BusPayload::Everyone { event, payload } => {
            let frame = events::encode(event, payload.clone());
            gw.registry
                .all_connections()
                .iter()
                .filter(|conn| conn.push(frame.clone()))
                .count()
        }
        BusPayload::Disconnect { user_id, reason } => {
            let (code, text) = match reason {
                DisconnectReason::Kick => (close_code::KICKED, "kicked"),
                DisconnectReason::Reconnect => (close_code::RECONNECT, "reconnect"),
            };
            let conns = gw.registry.connections_for_user(user_id);
            for conn in &conns {
                conn.close(code, text);
            }
            if !conns.is_empty() {
                tracing::info!(user_id = %user_id, connections = conns.len(), ?reason, "disconnected user");
            }
            conns.len()
        }
    }
}
