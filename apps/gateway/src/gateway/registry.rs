//! Per-instance index of local connections grouped by room.
//!
//! Nothing here is shared across instances; the broadcast bus bridges them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::Mutex;
use roomcast_common::RoomName;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::services::identity::Principal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    WebSocket,
    Polling,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::WebSocket => "websocket",
            Transport::Polling => "polling",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

/// Sending half of one client connection.
///
/// Frames are pre-serialized JSON shared by every recipient of the same event.
/// The transport task owning the receiving half writes them out in order.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: String,
    pub principal: Arc<Principal>,
    pub transport: Transport,
    tx: mpsc::Sender<Arc<str>>,
    closed: CancellationToken,
    close_reason: Arc<OnceLock<CloseReason>>,
}

impl ConnectionHandle {
    pub fn new(
        id: String,
        principal: Arc<Principal>,
        transport: Transport,
        buffer: usize,
        parent: &CancellationToken,
    ) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(buffer);
        let handle = Self {
            id,
            principal,
            transport,
            tx,
            closed: parent.child_token(),
            close_reason: Arc::new(OnceLock::new()),
        };
        (handle, rx)
    }

    pub fn user_id(&self) -> &str {
        &self.principal.id
    }

    /// Queue a frame without waiting. A full buffer means the client is not
    /// keeping up; the frame is dropped for this connection only.
    pub fn push(&self, frame: Arc<str>) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(connection_id = %self.id, "outbound buffer full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the transport to close. The first reason given wins.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.close_reason.set(CloseReason {
            code,
            reason: reason.to_string(),
        });
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once `close` was called or the gateway is shutting down.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().cloned()
    }
}

struct ConnectionEntry {
    handle: ConnectionHandle,
    rooms: Mutex<HashSet<RoomName>>,
}

/// Connections and the rooms they joined, on this instance only.
///
/// Lock order: a connection's entry before the room map.
#[derive(Default)]
pub struct RoomRegistry {
    connections: DashMap<String, ConnectionEntry>,
    rooms: DashMap<RoomName, HashMap<String, ConnectionHandle>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ConnectionHandle) {
        self.connections.insert(
            handle.id.clone(),
            ConnectionEntry {
                handle,
                rooms: Mutex::new(HashSet::new()),
            },
        );
    }

    /// Returns `true` if the connection was not already in the room.
    /// Unknown connections are ignored.
    pub fn add(&self, connection_id: &str, room: &RoomName) -> bool {
        let Some(entry) = self.connections.get(connection_id) else {
            return false;
        };
        let mut rooms = entry.rooms.lock();
        if !rooms.insert(room.clone()) {
            return false;
        }
        self.rooms
            .entry(room.clone())
            .or_default()
            .insert(connection_id.to_string(), entry.handle.clone());
        true
    }

    /// Returns `true` if the connection was in the room.
    pub fn remove(&self, connection_id: &str, room: &RoomName) -> bool {
        let Some(entry) = self.connections.get(connection_id) else {
            return false;
        };
        let mut rooms = entry.rooms.lock();
        if !rooms.remove(room) {
            return false;
        }
        self.unlink(connection_id, room);
        true
    }

    fn unlink(&self, connection_id: &str, room: &RoomName) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(connection_id);
        }
        self.rooms.remove_if(room, |_, members| members.is_empty());
    }

    pub fn local_members(&self, room: &RoomName) -> Vec<ConnectionHandle> {
        self.rooms
            .get(room)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Distinct user ids of the local members of `room`, sorted.
    pub fn local_member_ids(&self, room: &RoomName) -> Vec<String> {
        let mut ids: Vec<String> = self
            .local_members(room)
            .iter()
            .map(|h| h.user_id().to_string())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Unregister the connection and remove it from every room in one pass.
    /// Returns the rooms it had joined.
    pub fn drop_all(&self, connection_id: &str) -> Vec<RoomName> {
        let Some((_, entry)) = self.connections.remove(connection_id) else {
            return Vec::new();
        };
        let rooms: Vec<RoomName> = entry.rooms.lock().drain().collect();
        for room in &rooms {
            self.unlink(connection_id, room);
        }
        rooms
    }

    pub fn rooms_of(&self, connection_id: &str) -> Vec<RoomName> {
        self.connections
            .get(connection_id)
            .map(|e| e.rooms.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, connection_id: &str, room: &RoomName) -> bool {
        self.connections
            .get(connection_id)
            .is_some_and(|e| e.rooms.lock().contains(room))
    }

    /// Whether another local connection of `user_id` is still in `room`.
    pub fn user_has_other_connection_in(
        &self,
        user_id: &str,
        room: &RoomName,
        except_connection: &str,
    ) -> bool {
        self.rooms.get(room).is_some_and(|members| {
            members
                .values()
                .any(|h| h.id != except_connection && h.user_id() == user_id)
        })
    }

    pub fn connections_for_user(&self, user_id: &str) -> Vec<ConnectionHandle> {
        self.connections
            .iter()
            .filter(|e| e.handle.user_id() == user_id)
            .map(|e| e.handle.clone())
            .collect()
    }

    pub fn all_connections(&self) -> Vec<ConnectionHandle> {
        self.connections.iter().map(|e| e.handle.clone()).collect()
    }

    pub fn get(&self, connection_id: &str) -> Option<ConnectionHandle> {
        self.connections.get(connection_id).map(|e| e.handle.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
