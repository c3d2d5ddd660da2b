//! Redis backend shared by every gateway instance in a cluster.
//!
//! Key layout under `{prefix}`:
//!
//! | key                       | type   | content                          |
//! |---------------------------|--------|----------------------------------|
//! | `{prefix}:online`         | SET    | online identities                |
//! | `{prefix}:conns`          | HASH   | identity → live connection count |
//! | `{prefix}:roomconns:{id}` | HASH   | room → connections of id joined  |
//! | `{prefix}:status`         | HASH   | identity → presence status       |
//! | `{prefix}:presence`       | ZSET   | `identity|room` scored by lastSeen |
//! | `{prefix}:members:{room}` | SET    | identities present in room       |
//! | `{prefix}:rooms:{id}`     | SET    | rooms an identity is present in  |
//! | `{prefix}:party:{id}`     | STRING | watch party JSON                 |
//! | `{prefix}:views`          | HASH   | post id → pending view count     |
//!
//! Multi-key changes run as `MULTI` pipelines or Lua scripts so concurrent
//! instances never interleave a read-modify-write.
//!
//! The sweep script derives `members:` and `rooms:` keys from the entries it
//! finds, so they cannot be declared up front as `KEYS`. This backend
//! therefore needs a single Redis node (or a primary with replicas); it is
//! not usable against Redis Cluster, where undeclared keys may live on
//! another shard.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use roomcast_common::RoomName;

use super::{
    now_ms, PresenceEntry, PresenceStore, ViewCounterStore, WatchPartyState, WatchPartyStore,
};
use crate::error::GatewayError;
use crate::services::persistence::ViewCount;

const TOUCH_SCRIPT: &str = r#"
local rooms = redis.call('SMEMBERS', KEYS[1])
for _, room in ipairs(rooms) do
  redis.call('ZADD', KEYS[2], 'XX', ARGV[1], ARGV[2] .. '|' .. room)
end
return #rooms
"#;

const SWEEP_SCRIPT: &str = r#"
local stale = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1], 'WITHSCORES')
for i = 1, #stale, 2 do
  local member = stale[i]
  local sep = string.find(member, '|[^|]*$')
  local identity = string.sub(member, 1, sep - 1)
  local room = string.sub(member, sep + 1)
  redis.call('ZREM', KEYS[1], member)
  redis.call('SREM', ARGV[2] .. ':members:' .. room, identity)
  redis.call('SREM', ARGV[2] .. ':rooms:' .. identity, room)
end
return stale
"#;

const RELEASE_SCRIPT: &str = r#"
local n = redis.call('HINCRBY', KEYS[1], ARGV[1], -1)
if n <= 0 then
  redis.call('HDEL', KEYS[1], ARGV[1])
  return 0
end
return n
"#;

const WRITE_SYNC_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
  return false
end
local party = cjson.decode(raw)
if tonumber(ARGV[3]) >= tonumber(party.lastSyncAt) then
  party.currentTime = tonumber(ARGV[1])
  party.isPlaying = ARGV[2] == '1'
  party.lastSyncAt = tonumber(ARGV[3])
  raw = cjson.encode(party)
  redis.call('SET', KEYS[1], raw)
end
return raw
"#;

const DRAIN_SCRIPT: &str = r#"
local all = redis.call('HGETALL', KEYS[1])
redis.call('DEL', KEYS[1])
return all
"#;

pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    touch: Script,
    sweep: Script,
    release: Script,
    write_sync: Script,
    drain: Script,
}

impl RedisStore {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, GatewayError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, prefix))
    }

    pub fn new(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
            touch: Script::new(TOUCH_SCRIPT),
            sweep: Script::new(SWEEP_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            write_sync: Script::new(WRITE_SYNC_SCRIPT),
            drain: Script::new(DRAIN_SCRIPT),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn members_key(&self, room: &RoomName) -> String {
        format!("{}:members:{}", self.prefix, room)
    }

    fn rooms_key(&self, identity_id: &str) -> String {
        format!("{}:rooms:{}", self.prefix, identity_id)
    }

    fn room_conns_key(&self, identity_id: &str) -> String {
        format!("{}:roomconns:{}", self.prefix, identity_id)
    }

    fn party_key(&self, party_id: &str) -> String {
        format!("{}:party:{}", self.prefix, party_id)
    }
}

fn presence_member(identity_id: &str, room: &RoomName) -> String {
    format!("{identity_id}|{room}")
}

fn decode_party(raw: &str) -> Result<WatchPartyState, GatewayError> {
    serde_json::from_str(raw).map_err(|e| {
        tracing::error!(?e, "corrupt watch party record");
        GatewayError::upstream("corrupt watch party record")
    })
}

#[async_trait]
impl PresenceStore for RedisStore {
    async fn set_online(&self, identity_id: &str) -> Result<bool, GatewayError> {
        let mut conn = self.conn.clone();
        let added: i64 = conn.sadd(self.key("online"), identity_id).await?;
        Ok(added == 1)
    }

    async fn set_offline(&self, identity_id: &str) -> Result<bool, GatewayError> {
        let mut conn = self.conn.clone();
        let (removed,): (i64,) = redis::pipe()
            .atomic()
            .srem(self.key("online"), identity_id)
            .hdel(self.key("conns"), identity_id)
            .ignore()
            .hdel(self.key("status"), identity_id)
            .ignore()
            .del(self.room_conns_key(identity_id))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn is_online(&self, identity_id: &str) -> Result<bool, GatewayError> {
        let mut conn = self.conn.clone();
        let member: bool = conn.sismember(self.key("online"), identity_id).await?;
        Ok(member)
    }

    async fn online_count(&self) -> Result<u64, GatewayError> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.scard(self.key("online")).await?;
        Ok(count)
    }

    async fn filter_online(&self, identity_ids: &[String]) -> Result<Vec<String>, GatewayError> {
        if identity_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for id in identity_ids {
            pipe.sismember(self.key("online"), id);
        }
        let flags: Vec<bool> = pipe.query_async(&mut conn).await?;
        Ok(identity_ids
            .iter()
            .zip(flags)
            .filter(|(_, online)| *online)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn acquire_connection(&self, identity_id: &str) -> Result<u64, GatewayError> {
        let mut conn = self.conn.clone();
        let count: i64 = conn.hincr(self.key("conns"), identity_id, 1).await?;
        Ok(count.max(0) as u64)
    }

    async fn release_connection(&self, identity_id: &str) -> Result<u64, GatewayError> {
        let mut conn = self.conn.clone();
        let remaining: i64 = self
            .release
            .key(self.key("conns"))
            .arg(identity_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(remaining.max(0) as u64)
    }

    async fn acquire_room(&self, identity_id: &str, room: &RoomName) -> Result<u64, GatewayError> {
        let mut conn = self.conn.clone();
        let count: i64 = conn
            .hincr(self.room_conns_key(identity_id), room.to_string(), 1)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn release_room(&self, identity_id: &str, room: &RoomName) -> Result<u64, GatewayError> {
        let mut conn = self.conn.clone();
        let remaining: i64 = self
            .release
            .key(self.room_conns_key(identity_id))
            .arg(room.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(remaining.max(0) as u64)
    }

    async fn join(&self, identity_id: &str, room: &RoomName) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .zadd(self.key("presence"), presence_member(identity_id, room), now_ms())
            .ignore()
            .sadd(self.members_key(room), identity_id)
            .ignore()
            .sadd(self.rooms_key(identity_id), room.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn leave(&self, identity_id: &str, room: &RoomName) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .zrem(self.key("presence"), presence_member(identity_id, room))
            .ignore()
            .srem(self.members_key(room), identity_id)
            .ignore()
            .srem(self.rooms_key(identity_id), room.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn touch(&self, identity_id: &str) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .touch
            .key(self.rooms_key(identity_id))
            .key(self.key("presence"))
            .arg(now_ms())
            .arg(identity_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_room_members(&self, room: &RoomName) -> Result<Vec<String>, GatewayError> {
        let mut conn = self.conn.clone();
        let mut members: Vec<String> = conn.smembers(self.members_key(room)).await?;
        members.sort();
        Ok(members)
    }

    async fn rooms_of(&self, identity_id: &str) -> Result<Vec<RoomName>, GatewayError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.smembers(self.rooms_key(identity_id)).await?;
        let mut rooms: Vec<RoomName> = raw.iter().filter_map(|r| r.parse().ok()).collect();
        rooms.sort();
        Ok(rooms)
    }

    async fn sweep_before(&self, cutoff_ms: i64) -> Result<Vec<PresenceEntry>, GatewayError> {
        let mut conn = self.conn.clone();
        let flat: Vec<String> = self
            .sweep
            .key(self.key("presence"))
            .arg(cutoff_ms)
            .arg(&self.prefix)
            .invoke_async(&mut conn)
            .await?;

        let swept = flat
            .chunks_exact(2)
            .filter_map(|pair| {
                let (identity_id, room) = pair[0].rsplit_once('|')?;
                let room: RoomName = room.parse().ok()?;
                let last_seen_ms = pair[1].parse::<f64>().ok()? as i64;
                Some(PresenceEntry {
                    identity_id: identity_id.to_string(),
                    room,
                    last_seen_ms,
                })
            })
            .collect();
        Ok(swept)
    }

    async fn set_status(&self, identity_id: &str, status: &str) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(self.key("status"), identity_id, status).await?;
        Ok(())
    }

    async fn get_status(&self, identity_id: &str) -> Result<Option<String>, GatewayError> {
        let mut conn = self.conn.clone();
        let status: Option<String> = conn.hget(self.key("status"), identity_id).await?;
        Ok(status)
    }
}

#[async_trait]
impl WatchPartyStore for RedisStore {
    async fn get_party(&self, party_id: &str) -> Result<Option<WatchPartyState>, GatewayError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.party_key(party_id)).await?;
        raw.as_deref().map(decode_party).transpose()
    }

    async fn create_party(&self, state: &WatchPartyState) -> Result<bool, GatewayError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(state)
            .map_err(|_| GatewayError::validation("watch party is not serializable"))?;
        let created: Option<String> = redis::cmd("SET")
            .arg(self.party_key(&state.party_id))
            .arg(json)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(created.is_some())
    }

    async fn write_sync(
        &self,
        party_id: &str,
        current_time: f64,
        is_playing: bool,
        at_ms: i64,
    ) -> Result<Option<WatchPartyState>, GatewayError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = self
            .write_sync
            .key(self.party_key(party_id))
            .arg(current_time)
            .arg(if is_playing { "1" } else { "0" })
            .arg(at_ms)
            .invoke_async(&mut conn)
            .await?;
        raw.as_deref().map(decode_party).transpose()
    }
}

#[async_trait]
impl ViewCounterStore for RedisStore {
    async fn incr_view(&self, post_id: &str) -> Result<u64, GatewayError> {
        let mut conn = self.conn.clone();
        let count: i64 = conn.hincr(self.key("views"), post_id, 1).await?;
        Ok(count.max(0) as u64)
    }

    async fn drain_views(&self) -> Result<Vec<ViewCount>, GatewayError> {
        let mut conn = self.conn.clone();
        let flat: Vec<String> = self
            .drain
            .key(self.key("views"))
            .invoke_async(&mut conn)
            .await?;
        let mut drained: Vec<ViewCount> = flat
            .chunks_exact(2)
            .filter_map(|pair| {
                let views: u64 = pair[1].parse().ok()?;
                (views > 0).then(|| ViewCount {
                    post_id: pair[0].clone(),
                    views,
                })
            })
            .collect();
        drained.sort_by(|a, b| a.post_id.cmp(&b.post_id));
        Ok(drained)
    }

    async fn restore_views(&self, views: &[ViewCount]) -> Result<(), GatewayError> {
        if views.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for v in views {
            pipe.hincr(self.key("views"), &v.post_id, v.views).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}
