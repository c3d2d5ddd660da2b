//! Process-local backend for single-instance deployments and tests.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use roomcast_common::RoomName;

use super::{
    now_ms, PresenceEntry, PresenceStore, ViewCounterStore, WatchPartyState, WatchPartyStore,
};
use crate::error::GatewayError;
use crate::services::persistence::ViewCount;

/// All shared-state traits over `DashMap`s.
///
/// Entries are indexed both by identity and by room. Writers always lock the
/// identity index before the room index.
#[derive(Default)]
pub struct MemoryStore {
    online: DashSet<String>,
    connections: DashMap<String, u64>,
    room_connections: DashMap<(String, RoomName), u64>,
    statuses: DashMap<String, String>,
    entries: DashMap<String, HashMap<RoomName, i64>>,
    rooms: DashMap<RoomName, HashSet<String>>,
    parties: DashMap<String, WatchPartyState>,
    views: DashMap<String, u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn index_room(&self, room: &RoomName, identity_id: &str) {
        self.rooms
            .entry(room.clone())
            .or_default()
            .insert(identity_id.to_string());
    }

    fn unindex_room(&self, room: &RoomName, identity_id: &str) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(identity_id);
        }
        self.rooms.remove_if(room, |_, members| members.is_empty());
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn set_online(&self, identity_id: &str) -> Result<bool, GatewayError> {
        Ok(self.online.insert(identity_id.to_string()))
    }

    async fn set_offline(&self, identity_id: &str) -> Result<bool, GatewayError> {
        self.connections.remove(identity_id);
        self.room_connections.retain(|(id, _), _| id != identity_id);
        self.statuses.remove(identity_id);
        Ok(self.online.remove(identity_id).is_some())
    }

    async fn is_online(&self, identity_id: &str) -> Result<bool, GatewayError> {
        Ok(self.online.contains(identity_id))
    }

    async fn online_count(&self) -> Result<u64, GatewayError> {
        Ok(self.online.len() as u64)
    }

    async fn acquire_connection(&self, identity_id: &str) -> Result<u64, GatewayError> {
        let mut count = self.connections.entry(identity_id.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn release_connection(&self, identity_id: &str) -> Result<u64, GatewayError> {
        let remaining = match self.connections.get_mut(identity_id) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            self.connections.remove_if(identity_id, |_, c| *c == 0);
        }
        Ok(remaining)
    }

    async fn acquire_room(&self, identity_id: &str, room: &RoomName) -> Result<u64, GatewayError> {
        let key = (identity_id.to_string(), room.clone());
        let mut count = self.room_connections.entry(key).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn release_room(&self, identity_id: &str, room: &RoomName) -> Result<u64, GatewayError> {
        let key = (identity_id.to_string(), room.clone());
        let remaining = match self.room_connections.get_mut(&key) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            self.room_connections.remove_if(&key, |_, c| *c == 0);
        }
        Ok(remaining)
    }

    async fn join(&self, identity_id: &str, room: &RoomName) -> Result<(), GatewayError> {
        let mut rooms = self.entries.entry(identity_id.to_string()).or_default();
        rooms.insert(room.clone(), now_ms());
        self.index_room(room, identity_id);
        Ok(())
    }

    async fn leave(&self, identity_id: &str, room: &RoomName) -> Result<(), GatewayError> {
        if let Some(mut rooms) = self.entries.get_mut(identity_id) {
            rooms.remove(room);
            self.unindex_room(room, identity_id);
        }
        self.entries.remove_if(identity_id, |_, rooms| rooms.is_empty());
        Ok(())
    }

    async fn touch(&self, identity_id: &str) -> Result<(), GatewayError> {
        if let Some(mut rooms) = self.entries.get_mut(identity_id) {
            let now = now_ms();
            for last_seen in rooms.values_mut() {
                *last_seen = now;
            }
        }
        Ok(())
    }

    async fn list_room_members(&self, room: &RoomName) -> Result<Vec<String>, GatewayError> {
        let mut members: Vec<String> = self
            .rooms
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn rooms_of(&self, identity_id: &str) -> Result<Vec<RoomName>, GatewayError> {
        let mut rooms: Vec<RoomName> = self
            .entries
            .get(identity_id)
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        Ok(rooms)
    }

    async fn sweep_before(&self, cutoff_ms: i64) -> Result<Vec<PresenceEntry>, GatewayError> {
        let mut swept = Vec::new();
        self.entries.retain(|identity_id, rooms| {
            rooms.retain(|room, last_seen| {
                if *last_seen < cutoff_ms {
                    swept.push(PresenceEntry {
                        identity_id: identity_id.clone(),
                        room: room.clone(),
                        last_seen_ms: *last_seen,
                    });
                    false
                } else {
                    true
                }
            });
            !rooms.is_empty()
        });
        for entry in &swept {
            // A concurrent join may have re-created the entry since `retain`.
            let rooms = self.entries.get(&entry.identity_id);
            if rooms.as_ref().is_some_and(|r| r.contains_key(&entry.room)) {
                continue;
            }
            self.unindex_room(&entry.room, &entry.identity_id);
        }
        Ok(swept)
    }

    async fn set_status(&self, identity_id: &str, status: &str) -> Result<(), GatewayError> {
        self.statuses
            .insert(identity_id.to_string(), status.to_string());
        Ok(())
    }

    async fn get_status(&self, identity_id: &str) -> Result<Option<String>, GatewayError> {
        Ok(self.statuses.get(identity_id).map(|s| s.clone()))
    }
}

#[async_trait]
impl WatchPartyStore for MemoryStore {
    async fn get_party(&self, party_id: &str) -> Result<Option<WatchPartyState>, GatewayError> {
        Ok(self.parties.get(party_id).map(|p| p.clone()))
    }

    async fn create_party(&self, state: &WatchPartyState) -> Result<bool, GatewayError> {
        match self.parties.entry(state.party_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(state.clone());
                Ok(true)
            }
        }
    }

    async fn write_sync(
        &self,
        party_id: &str,
        current_time: f64,
        is_playing: bool,
        at_ms: i64,
    ) -> Result<Option<WatchPartyState>, GatewayError> {
        let Some(mut party) = self.parties.get_mut(party_id) else {
            return Ok(None);
        };
        if at_ms >= party.last_sync_at {
            party.current_time = current_time;
            party.is_playing = is_playing;
            party.last_sync_at = at_ms;
        }
        Ok(Some(party.clone()))
    }
}

#[async_trait]
impl ViewCounterStore for MemoryStore {
    async fn incr_view(&self, post_id: &str) -> Result<u64, GatewayError> {
        let mut count = self.views.entry(post_id.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn drain_views(&self) -> Result<Vec<ViewCount>, GatewayError> {
        let keys: Vec<String> = self.views.iter().map(|e| e.key().clone()).collect();
        let mut drained: Vec<ViewCount> = keys
            .into_iter()
            .filter_map(|post_id| self.views.remove(&post_id))
            .filter(|(_, views)| *views > 0)
            .map(|(post_id, views)| ViewCount { post_id, views })
            .collect();
        drained.sort_by(|a, b| a.post_id.cmp(&b.post_id));
        Ok(drained)
    }

    async fn restore_views(&self, views: &[ViewCount]) -> Result<(), GatewayError> {
        for v in views {
            *self.views.entry(v.post_id.clone()).or_insert(0) += v.views;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn room(name: &str) -> RoomName {
        name.parse().unwrap()
    }

    #[tokio::test]
    async fn join_and_leave_are_idempotent() {
        let store = MemoryStore::new();
        let post = room("post:42");

        store.join("usr_a", &post).await.unwrap();
        store.join("usr_a", &post).await.unwrap();
        assert_eq!(store.list_room_members(&post).await.unwrap(), vec!["usr_a"]);

        store.leave("usr_a", &post).await.unwrap();
        store.leave("usr_a", &post).await.unwrap();
        assert!(store.list_room_members(&post).await.unwrap().is_empty());
        assert!(store.rooms_of("usr_a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_removes_only_strictly_older_entries() {
        let store = MemoryStore::new();
        let post = room("post:42");
        store.join("usr_old", &post).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let cutoff = now_ms();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.join("usr_new", &post).await.unwrap();

        let swept = store.sweep_before(cutoff).await.unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].identity_id, "usr_old");
        assert_eq!(swept[0].room, post);
        assert_eq!(store.list_room_members(&post).await.unwrap(), vec!["usr_new"]);

        // Sweeping again is a no-op.
        assert!(store.sweep_before(cutoff).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn touch_keeps_entries_out_of_the_sweep() {
        let store = MemoryStore::new();
        let post = room("post:1");
        store.join("usr_a", &post).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let cutoff = now_ms();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.touch("usr_a").await.unwrap();

        assert!(store.sweep_before(cutoff).await.unwrap().is_empty());
        assert_eq!(store.rooms_of("usr_a").await.unwrap(), vec![post]);
    }

    #[tokio::test]
    async fn online_flag_is_independent_of_rooms() {
        let store = MemoryStore::new();
        assert!(store.set_online("usr_a").await.unwrap());
        assert!(!store.set_online("usr_a").await.unwrap());
        assert!(store.is_online("usr_a").await.unwrap());
        assert!(store.rooms_of("usr_a").await.unwrap().is_empty());
        assert_eq!(store.online_count().await.unwrap(), 1);

        assert!(store.set_offline("usr_a").await.unwrap());
        assert!(!store.set_offline("usr_a").await.unwrap());
        assert_eq!(store.online_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn connection_counting() {
        let store = MemoryStore::new();
        assert_eq!(store.acquire_connection("usr_a").await.unwrap(), 1);
        assert_eq!(store.acquire_connection("usr_a").await.unwrap(), 2);
        assert_eq!(store.release_connection("usr_a").await.unwrap(), 1);
        assert_eq!(store.release_connection("usr_a").await.unwrap(), 0);
        assert_eq!(store.release_connection("usr_a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn room_connections_are_counted_per_room() {
        let store = MemoryStore::new();
        let post = room("post:42");
        let chat = room("chat:c1");
        assert_eq!(store.acquire_room("usr_a", &post).await.unwrap(), 1);
        assert_eq!(store.acquire_room("usr_a", &post).await.unwrap(), 2);
        assert_eq!(store.acquire_room("usr_a", &chat).await.unwrap(), 1);
        assert_eq!(store.acquire_room("usr_b", &post).await.unwrap(), 1);

        assert_eq!(store.release_room("usr_a", &post).await.unwrap(), 1);
        assert_eq!(store.release_room("usr_a", &post).await.unwrap(), 0);
        assert_eq!(store.release_room("usr_a", &post).await.unwrap(), 0);
        assert_eq!(store.release_room("usr_b", &post).await.unwrap(), 0);

        // Going offline forgets whatever was still counted.
        store.set_online("usr_a").await.unwrap();
        store.set_offline("usr_a").await.unwrap();
        assert_eq!(store.acquire_room("usr_a", &chat).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn watch_party_sync_is_last_write_wins() {
        let store = MemoryStore::new();
        let party = WatchPartyState {
            party_id: "p1".into(),
            current_time: 0.0,
            is_playing: false,
            host_id: "usr_host".into(),
            last_sync_at: 100,
        };
        assert!(store.create_party(&party).await.unwrap());
        assert!(!store.create_party(&party).await.unwrap());

        let after = store.write_sync("p1", 12.5, true, 200).await.unwrap().unwrap();
        assert_eq!(after.current_time, 12.5);
        assert!(after.is_playing);

        // An older write does not clobber a newer one.
        let after = store.write_sync("p1", 3.0, false, 150).await.unwrap().unwrap();
        assert_eq!(after.current_time, 12.5);
        assert_eq!(after.last_sync_at, 200);

        assert!(store.write_sync("nope", 1.0, true, 300).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn drained_views_start_from_zero() {
        let store = MemoryStore::new();
        store.incr_view("42").await.unwrap();
        store.incr_view("42").await.unwrap();
        store.incr_view("7").await.unwrap();

        let drained = store.drain_views().await.unwrap();
        assert_eq!(
            drained,
            vec![
                ViewCount { post_id: "42".into(), views: 2 },
                ViewCount { post_id: "7".into(), views: 1 },
            ]
        );
        assert!(store.drain_views().await.unwrap().is_empty());

        store.restore_views(&drained).await.unwrap();
        assert_eq!(store.incr_view("42").await.unwrap(), 3);
    }
}
