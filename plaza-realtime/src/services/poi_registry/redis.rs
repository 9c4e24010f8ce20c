//! Redis-backed POI registry.
//!
//! Participant sets live under `plaza:poi:{id}:members`, with a reverse
//! index `plaza:session:{id}:pois` for the disconnect path and a tombstone
//! key `plaza:poi:{id}:deleted` that rejects joins after deletion. Every
//! compound operation is one Lua script, so "check then add" is indivisible
//! across all nodes sharing the store; a SCARD-then-SADD sequence from the
//! client side would admit two sessions into the last slot.

use std::time::Duration;

use async_trait::async_trait;
use plaza_types::{PoiId, SessionId};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::services::poi_registry::{
    JoinOutcome, LeaveOutcome, MoveOutcome, PoiRegistry, PoiRegistryError,
};

/// Tombstones only need to outlive in-flight join attempts; an hour is
/// generous and keeps the keyspace from accumulating deleted POIs.
const TOMBSTONE_TTL_SECS: u64 = 3600;

const JOIN_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[3]) == 1 then
  return {'deleted', 0}
end
if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1 then
  return {'already', redis.call('SCARD', KEYS[1])}
end
if redis.call('SCARD', KEYS[1]) >= tonumber(ARGV[2]) then
  return {'capacity', redis.call('SCARD', KEYS[1])}
end
redis.call('SADD', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[2], ARGV[3])
return {'joined', redis.call('SCARD', KEYS[1])}
";

const LEAVE_SCRIPT: &str = r"
if redis.call('SREM', KEYS[1], ARGV[1]) == 1 then
  redis.call('SREM', KEYS[2], ARGV[2])
  return {'left', redis.call('SCARD', KEYS[1])}
end
return {'notmember', redis.call('SCARD', KEYS[1])}
";

const MOVE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[4]) == 1 then
  return {'deleted', 0, 0}
end
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then
  return {'already', redis.call('SCARD', KEYS[1]), redis.call('SCARD', KEYS[2])}
end
if redis.call('SCARD', KEYS[2]) >= tonumber(ARGV[2]) then
  return {'capacity', redis.call('SCARD', KEYS[1]), redis.call('SCARD', KEYS[2])}
end
redis.call('SREM', KEYS[1], ARGV[1])
redis.call('SREM', KEYS[3], ARGV[3])
redis.call('SADD', KEYS[2], ARGV[1])
redis.call('SADD', KEYS[3], ARGV[4])
return {'moved', redis.call('SCARD', KEYS[1]), redis.call('SCARD', KEYS[2])}
";

// Key construction inside the script ties this to a non-clustered store,
// which matches the deployment the presence layout already assumes.
const REMOVE_FROM_ALL_SCRIPT: &str = r"
local pois = redis.call('SMEMBERS', KEYS[1])
local result = {}
for _, poi in ipairs(pois) do
  local members_key = ARGV[2] .. poi .. ':members'
  redis.call('SREM', members_key, ARGV[1])
  table.insert(result, {poi, redis.call('SCARD', members_key)})
end
redis.call('DEL', KEYS[1])
return result
";

const CLEAR_SCRIPT: &str = r"
local members = redis.call('SMEMBERS', KEYS[1])
for _, sid in ipairs(members) do
  redis.call('SREM', ARGV[2] .. sid .. ':pois', ARGV[1])
end
redis.call('DEL', KEYS[1])
redis.call('SET', KEYS[2], '1', 'EX', tonumber(ARGV[3]))
return members
";

/// POI registry backed by a shared Redis instance.
pub struct RedisPoiRegistry {
    conn: ConnectionManager,
    op_timeout: Duration,
    join_script: Script,
    leave_script: Script,
    move_script: Script,
    remove_from_all_script: Script,
    clear_script: Script,
}

impl RedisPoiRegistry {
    /// Connects to the store and prepares the membership scripts.
    pub async fn connect(url: &str, op_timeout: Duration) -> eyre::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            op_timeout,
            join_script: Script::new(JOIN_SCRIPT),
            leave_script: Script::new(LEAVE_SCRIPT),
            move_script: Script::new(MOVE_SCRIPT),
            remove_from_all_script: Script::new(REMOVE_FROM_ALL_SCRIPT),
            clear_script: Script::new(CLEAR_SCRIPT),
        })
    }

    const POI_PREFIX: &'static str = "plaza:poi:";
    const SESSION_PREFIX: &'static str = "plaza:session:";

    fn members_key(poi_id: &PoiId) -> String {
        format!("{}{poi_id}:members", Self::POI_PREFIX)
    }

    fn tombstone_key(poi_id: &PoiId) -> String {
        format!("{}{poi_id}:deleted", Self::POI_PREFIX)
    }

    fn reverse_key(session_id: SessionId) -> String {
        format!("{}{session_id}:pois", Self::SESSION_PREFIX)
    }

    async fn with_timeout<T>(
        &self,
        what: &'static str,
        fut: impl Future<Output = redis::RedisResult<T>> + Send,
    ) -> Result<T, PoiRegistryError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(PoiRegistryError::Store(err.into())),
            Err(_) => Err(PoiRegistryError::Store(eyre::eyre!(
                "{what} timed out after {:?}",
                self.op_timeout
            ))),
        }
    }
}

#[async_trait]
impl PoiRegistry for RedisPoiRegistry {
    async fn join(
        &self,
        poi_id: &PoiId,
        session_id: SessionId,
        max: u32,
    ) -> Result<JoinOutcome, PoiRegistryError> {
        let mut conn = self.conn.clone();
        let members_key = Self::members_key(poi_id);
        let reverse_key = Self::reverse_key(session_id);
        let tombstone_key = Self::tombstone_key(poi_id);
        let poi = poi_id.to_string();
        let (outcome, count): (String, u32) = self
            .with_timeout("poi join", async move {
                self.join_script
                    .key(members_key)
                    .key(reverse_key)
                    .key(tombstone_key)
                    .arg(session_id.to_string())
                    .arg(max)
                    .arg(poi)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(match outcome.as_str() {
            "joined" => JoinOutcome::Joined { count },
            "already" => JoinOutcome::AlreadyMember { count },
            "capacity" => JoinOutcome::CapacityExceeded { count },
            _ => JoinOutcome::Deleted,
        })
    }

    async fn leave(
        &self,
        poi_id: &PoiId,
        session_id: SessionId,
    ) -> Result<LeaveOutcome, PoiRegistryError> {
        let mut conn = self.conn.clone();
        let members_key = Self::members_key(poi_id);
        let reverse_key = Self::reverse_key(session_id);
        let poi = poi_id.to_string();
        let (outcome, count): (String, u32) = self
            .with_timeout("poi leave", async move {
                self.leave_script
                    .key(members_key)
                    .key(reverse_key)
                    .arg(session_id.to_string())
                    .arg(poi)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(match outcome.as_str() {
            "left" => LeaveOutcome::Left { count },
            _ => LeaveOutcome::NotMember,
        })
    }

    async fn move_membership(
        &self,
        from: &PoiId,
        to: &PoiId,
        session_id: SessionId,
        to_max: u32,
    ) -> Result<MoveOutcome, PoiRegistryError> {
        let mut conn = self.conn.clone();
        let from_key = Self::members_key(from);
        let to_key = Self::members_key(to);
        let reverse_key = Self::reverse_key(session_id);
        let tombstone_key = Self::tombstone_key(to);
        let from_poi = from.to_string();
        let to_poi = to.to_string();
        let (outcome, from_count, to_count): (String, u32, u32) = self
            .with_timeout("poi move", async move {
                self.move_script
                    .key(from_key)
                    .key(to_key)
                    .key(reverse_key)
                    .key(tombstone_key)
                    .arg(session_id.to_string())
                    .arg(to_max)
                    .arg(from_poi)
                    .arg(to_poi)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(match outcome.as_str() {
            "moved" => MoveOutcome::Moved {
                from_count,
                to_count,
            },
            "already" => MoveOutcome::AlreadyMember { count: to_count },
            "capacity" => MoveOutcome::CapacityExceeded { count: to_count },
            _ => MoveOutcome::Deleted,
        })
    }

    async fn count(&self, poi_id: &PoiId) -> Result<u32, PoiRegistryError> {
        let mut conn = self.conn.clone();
        let key = Self::members_key(poi_id);
        self.with_timeout("poi count", async move {
            conn.scard::<_, u32>(key).await
        })
        .await
    }

    async fn members(&self, poi_id: &PoiId) -> Result<Vec<SessionId>, PoiRegistryError> {
        let mut conn = self.conn.clone();
        let key = Self::members_key(poi_id);
        let raw: Vec<String> = self
            .with_timeout("poi members", async move {
                conn.smembers::<_, Vec<String>>(key).await
            })
            .await?;
        Ok(raw.iter().filter_map(|id| SessionId::parse(id)).collect())
    }

    async fn is_member(
        &self,
        poi_id: &PoiId,
        session_id: SessionId,
    ) -> Result<bool, PoiRegistryError> {
        let mut conn = self.conn.clone();
        let key = Self::members_key(poi_id);
        self.with_timeout("poi is_member", async move {
            conn.sismember::<_, _, bool>(key, session_id.to_string()).await
        })
        .await
    }

    async fn can_join(&self, poi_id: &PoiId, max: u32) -> Result<bool, PoiRegistryError> {
        let mut conn = self.conn.clone();
        let members_key = Self::members_key(poi_id);
        let tombstone_key = Self::tombstone_key(poi_id);
        let (count, deleted): (u32, bool) = self
            .with_timeout("poi can_join", async move {
                redis::pipe()
                    .scard(&members_key)
                    .exists(&tombstone_key)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(!deleted && count < max)
    }

    async fn remove_from_all(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<(PoiId, u32)>, PoiRegistryError> {
        let mut conn = self.conn.clone();
        let reverse_key = Self::reverse_key(session_id);
        let affected: Vec<(String, u32)> = self
            .with_timeout("poi remove_from_all", async move {
                self.remove_from_all_script
                    .key(reverse_key)
                    .arg(session_id.to_string())
                    .arg(Self::POI_PREFIX)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(affected
            .into_iter()
            .map(|(poi, count)| (PoiId::from(poi), count))
            .collect())
    }

    async fn clear(&self, poi_id: &PoiId) -> Result<Vec<SessionId>, PoiRegistryError> {
        let mut conn = self.conn.clone();
        let members_key = Self::members_key(poi_id);
        let tombstone_key = Self::tombstone_key(poi_id);
        let poi = poi_id.to_string();
        let evicted: Vec<String> = self
            .with_timeout("poi clear", async move {
                self.clear_script
                    .key(members_key)
                    .key(tombstone_key)
                    .arg(poi)
                    .arg(Self::SESSION_PREFIX)
                    .arg(TOMBSTONE_TTL_SECS)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(evicted.iter().filter_map(|id| SessionId::parse(id)).collect())
    }
}
