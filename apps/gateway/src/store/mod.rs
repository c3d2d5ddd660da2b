//! Shared state that must be visible to every gateway instance.
//!
//! Backed by Redis in a cluster and by process memory when running a single
//! instance. Every mutation is a single atomic operation on the backend.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use roomcast_common::RoomName;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::GatewayError;
use crate::services::persistence::ViewCount;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Milliseconds since the Unix epoch. Presence timestamps are shared across
/// machines, so they use wall-clock time.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// One `(identity, room)` participation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub identity_id: String,
    pub room: RoomName,
    pub last_seen_ms: i64,
}

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Set the global online flag. Returns `true` if the identity was offline.
    async fn set_online(&self, identity_id: &str) -> Result<bool, GatewayError>;
    /// Clear the global online flag and any connection counts. Returns `true`
    /// if the identity was online.
    async fn set_offline(&self, identity_id: &str) -> Result<bool, GatewayError>;
    async fn is_online(&self, identity_id: &str) -> Result<bool, GatewayError>;
    async fn online_count(&self) -> Result<u64, GatewayError>;

    /// The subset of `identity_ids` currently online, in input order.
    async fn filter_online(&self, identity_ids: &[String]) -> Result<Vec<String>, GatewayError> {
        let mut online = Vec::new();
        for id in identity_ids {
            if self.is_online(id).await? {
                online.push(id.clone());
            }
        }
        Ok(online)
    }

    /// Count one more live connection for the identity, across all instances.
    async fn acquire_connection(&self, identity_id: &str) -> Result<u64, GatewayError>;
    /// Count one connection less. Returns how many remain.
    async fn release_connection(&self, identity_id: &str) -> Result<u64, GatewayError>;

    /// Count one more connection of the identity joined to `room`, across
    /// all instances. The presence entry itself is written by [`join`].
    ///
    /// [`join`]: PresenceStore::join
    async fn acquire_room(&self, identity_id: &str, room: &RoomName) -> Result<u64, GatewayError>;
    /// Count one connection less in `room`. The entry must only be removed
    /// once this returns 0.
    async fn release_room(&self, identity_id: &str, room: &RoomName) -> Result<u64, GatewayError>;

    /// Upsert the entry for `(identity, room)` with a fresh timestamp.
    async fn join(&self, identity_id: &str, room: &RoomName) -> Result<(), GatewayError>;
    async fn leave(&self, identity_id: &str, room: &RoomName) -> Result<(), GatewayError>;
    /// Refresh the timestamp of every entry the identity holds.
    async fn touch(&self, identity_id: &str) -> Result<(), GatewayError>;
    async fn list_room_members(&self, room: &RoomName) -> Result<Vec<String>, GatewayError>;
    async fn rooms_of(&self, identity_id: &str) -> Result<Vec<RoomName>, GatewayError>;

    /// Delete every entry last seen strictly before `cutoff_ms` and return them.
    async fn sweep_before(&self, cutoff_ms: i64) -> Result<Vec<PresenceEntry>, GatewayError>;

    /// Delete every entry older than `max_age` and return them.
    async fn sweep_stale(&self, max_age: Duration) -> Result<Vec<PresenceEntry>, GatewayError> {
        self.sweep_before(now_ms() - max_age.as_millis() as i64).await
    }

    async fn set_status(&self, identity_id: &str, status: &str) -> Result<(), GatewayError>;
    async fn get_status(&self, identity_id: &str) -> Result<Option<String>, GatewayError>;
}

/// Authoritative playback state of one watch party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WatchPartyState {
    pub party_id: String,
    pub current_time: f64,
    pub is_playing: bool,
    pub host_id: String,
    pub last_sync_at: i64,
}

#[async_trait]
pub trait WatchPartyStore: Send + Sync {
    async fn get_party(&self, party_id: &str) -> Result<Option<WatchPartyState>, GatewayError>;
    /// Store `state` unless a party with the same id exists. Returns whether it was stored.
    async fn create_party(&self, state: &WatchPartyState) -> Result<bool, GatewayError>;
    /// Overwrite playback fields if `at_ms` is not older than the stored
    /// `last_sync_at`. Returns the state held after the write, `None` if the
    /// party does not exist.
    async fn write_sync(
        &self,
        party_id: &str,
        current_time: f64,
        is_playing: bool,
        at_ms: i64,
    ) -> Result<Option<WatchPartyState>, GatewayError>;
}

#[async_trait]
pub trait ViewCounterStore: Send + Sync {
    async fn incr_view(&self, post_id: &str) -> Result<u64, GatewayError>;
    /// Take every pending counter and reset them to zero.
    async fn drain_views(&self) -> Result<Vec<ViewCount>, GatewayError>;
    /// Put counts back after a failed flush.
    async fn restore_views(&self, views: &[ViewCount]) -> Result<(), GatewayError>;
}
