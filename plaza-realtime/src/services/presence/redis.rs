//! Redis-backed presence store.
//!
//! Sessions live as JSON values under `plaza:session:{id}` with a TTL; a
//! per-map index set `plaza:map:{id}:sessions` and the global map index
//! `plaza:maps` make `list_active` and the reaper expressible. Index entries
//! whose session key expired are pruned on read.
//!
//! Compound read-modify-write mutations run as Lua scripts so all mutations
//! of one session key serialize store-side, which is what makes them safe
//! when several backend nodes share the store.

use std::time::Duration;

use async_trait::async_trait;
use plaza_types::{MapId, PoiId, Position, Session, SessionId, Timestamp};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::services::presence::{PresenceError, PresenceStore};

const TOUCH_SCRIPT: &str = r"
local raw = redis.call('GET', KEYS[1])
if raw == false then
  return 0
end
local s = cjson.decode(raw)
local now = tonumber(ARGV[2])
if now > tonumber(s.last_active) then
  s.last_active = now
end
redis.call('SET', KEYS[1], cjson.encode(s), 'PX', ARGV[1])
return 1
";

const UPDATE_POSITION_SCRIPT: &str = r"
local raw = redis.call('GET', KEYS[1])
if raw == false then
  return 0
end
local s = cjson.decode(raw)
s.position = { lat = tonumber(ARGV[1]), lng = tonumber(ARGV[2]) }
local now = tonumber(ARGV[3])
if now > tonumber(s.last_active) then
  s.last_active = now
end
redis.call('SET', KEYS[1], cjson.encode(s), 'KEEPTTL')
return 1
";

const SET_CURRENT_POI_SCRIPT: &str = r"
local raw = redis.call('GET', KEYS[1])
if raw == false then
  return 0
end
local s = cjson.decode(raw)
if ARGV[1] == '' then
  s.current_poi = cjson.null
else
  s.current_poi = ARGV[1]
end
local now = tonumber(ARGV[2])
if now > tonumber(s.last_active) then
  s.last_active = now
end
redis.call('SET', KEYS[1], cjson.encode(s), 'KEEPTTL')
return 1
";

// Re-checks last_active inside the store so a session touched between the
// reaper's scan and its removal survives.
const REAP_ONE_SCRIPT: &str = r"
local raw = redis.call('GET', KEYS[1])
if raw == false then
  redis.call('SREM', KEYS[2], ARGV[1])
  return 0
end
local s = cjson.decode(raw)
if tonumber(s.last_active) >= tonumber(ARGV[2]) then
  return 0
end
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[1])
return 1
";

/// Presence store backed by a shared Redis instance.
pub struct RedisPresenceStore {
    conn: ConnectionManager,
    op_timeout: Duration,
    touch_script: Script,
    update_position_script: Script,
    set_current_poi_script: Script,
    reap_one_script: Script,
}

impl RedisPresenceStore {
    /// Connects to the store and prepares the mutation scripts.
    pub async fn connect(url: &str, op_timeout: Duration) -> eyre::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            op_timeout,
            touch_script: Script::new(TOUCH_SCRIPT),
            update_position_script: Script::new(UPDATE_POSITION_SCRIPT),
            set_current_poi_script: Script::new(SET_CURRENT_POI_SCRIPT),
            reap_one_script: Script::new(REAP_ONE_SCRIPT),
        })
    }

    fn session_key(session_id: SessionId) -> String {
        format!("plaza:session:{session_id}")
    }

    fn map_key(map_id: &MapId) -> String {
        format!("plaza:map:{map_id}:sessions")
    }

    const MAPS_KEY: &'static str = "plaza:maps";

    async fn with_timeout<T>(
        &self,
        what: &'static str,
        fut: impl Future<Output = redis::RedisResult<T>> + Send,
    ) -> Result<T, PresenceError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(PresenceError::Store(err.into())),
            Err(_) => Err(PresenceError::Store(eyre::eyre!(
                "{what} timed out after {:?}",
                self.op_timeout
            ))),
        }
    }

    /// Runs one of the read-modify-write scripts; `0` means the key is gone.
    async fn mutate(
        &self,
        what: &'static str,
        session_id: SessionId,
        script: &Script,
        args: Vec<String>,
    ) -> Result<(), PresenceError> {
        let mut conn = self.conn.clone();
        let key = Self::session_key(session_id);
        let found: i64 = self
            .with_timeout(what, async move {
                let mut invocation = script.key(key);
                for arg in args {
                    invocation.arg(arg);
                }
                invocation.invoke_async(&mut conn).await
            })
            .await?;
        if found == 0 {
            return Err(PresenceError::NotFound(session_id));
        }
        Ok(())
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn put(&self, session: Session, ttl: Duration) -> Result<(), PresenceError> {
        let json = serde_json::to_string(&session)
            .map_err(|err| PresenceError::Store(err.into()))?;
        let mut conn = self.conn.clone();
        let session_key = Self::session_key(session.id);
        let map_key = Self::map_key(&session.map_id);
        let session_id = session.id.to_string();
        let map_id = session.map_id.to_string();
        let ttl_ms = ttl.as_millis() as u64;
        self.with_timeout("presence put", async move {
            redis::pipe()
                .atomic()
                .cmd("SET")
                .arg(&session_key)
                .arg(json)
                .arg("PX")
                .arg(ttl_ms)
                .ignore()
                .sadd(&map_key, session_id)
                .ignore()
                .sadd(Self::MAPS_KEY, map_id)
                .ignore()
                .query_async::<()>(&mut conn)
                .await
        })
        .await
    }

    async fn get(&self, session_id: SessionId) -> Result<Session, PresenceError> {
        let mut conn = self.conn.clone();
        let key = Self::session_key(session_id);
        let raw: Option<String> = self
            .with_timeout("presence get", async move {
                conn.get::<_, Option<String>>(key).await
            })
            .await?;
        let raw = raw.ok_or(PresenceError::NotFound(session_id))?;
        serde_json::from_str(&raw).map_err(|err| PresenceError::Store(err.into()))
    }

    async fn touch(&self, session_id: SessionId, ttl: Duration) -> Result<(), PresenceError> {
        self.mutate(
            "presence touch",
            session_id,
            &self.touch_script,
            vec![
                (ttl.as_millis() as u64).to_string(),
                Timestamp::now().as_millis().to_string(),
            ],
        )
        .await
    }

    async fn update_position(
        &self,
        session_id: SessionId,
        position: Position,
    ) -> Result<(), PresenceError> {
        self.mutate(
            "presence update_position",
            session_id,
            &self.update_position_script,
            vec![
                position.lat.to_string(),
                position.lng.to_string(),
                Timestamp::now().as_millis().to_string(),
            ],
        )
        .await
    }

    async fn set_current_poi(
        &self,
        session_id: SessionId,
        poi: Option<PoiId>,
    ) -> Result<(), PresenceError> {
        self.mutate(
            "presence set_current_poi",
            session_id,
            &self.set_current_poi_script,
            vec![
                poi.map(|poi| poi.to_string()).unwrap_or_default(),
                Timestamp::now().as_millis().to_string(),
            ],
        )
        .await
    }

    async fn remove(&self, session_id: SessionId) -> Result<(), PresenceError> {
        // learn the map for index cleanup; a racing removal just means the
        // index entry gets pruned on the next read instead
        let map_id = match self.get(session_id).await {
            Ok(session) => Some(session.map_id),
            Err(PresenceError::NotFound(_)) => None,
            Err(err) => return Err(err),
        };
        let mut conn = self.conn.clone();
        let session_key = Self::session_key(session_id);
        self.with_timeout("presence remove", async move {
            let mut pipe = redis::pipe();
            pipe.del(&session_key).ignore();
            if let Some(map_id) = map_id {
                pipe.srem(Self::map_key(&map_id), session_id.to_string())
                    .ignore();
            }
            pipe.query_async::<()>(&mut conn).await
        })
        .await
    }

    async fn list_active(&self, map_id: &MapId) -> Result<Vec<Session>, PresenceError> {
        let mut conn = self.conn.clone();
        let map_key = Self::map_key(map_id);
        let ids: Vec<String> = self
            .with_timeout("presence list_active", {
                let map_key = map_key.clone();
                let mut conn = conn.clone();
                async move { conn.smembers::<_, Vec<String>>(map_key).await }
            })
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("plaza:session:{id}"))
            .collect();
        let raws: Vec<Option<String>> = self
            .with_timeout("presence list_active", {
                let mut conn = conn.clone();
                let keys = keys.clone();
                async move { conn.mget::<_, Vec<Option<String>>>(keys).await }
            })
            .await?;

        let mut sessions = Vec::with_capacity(raws.len());
        let mut expired = Vec::new();
        for (id, raw) in ids.into_iter().zip(raws) {
            match raw {
                Some(raw) => sessions.push(
                    serde_json::from_str(&raw).map_err(|err| PresenceError::Store(err.into()))?,
                ),
                None => expired.push(id),
            }
        }
        if !expired.is_empty() {
            self.with_timeout("presence index prune", async move {
                conn.srem::<_, _, ()>(map_key, expired).await
            })
            .await?;
        }
        Ok(sessions)
    }

    async fn active_maps(&self) -> Result<Vec<MapId>, PresenceError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = self
            .with_timeout("presence active_maps", async move {
                conn.smembers::<_, Vec<String>>(Self::MAPS_KEY).await
            })
            .await?;
        Ok(ids.into_iter().map(MapId::from).collect())
    }

    async fn reap(
        &self,
        map_id: &MapId,
        idle_threshold: Duration,
    ) -> Result<Vec<Session>, PresenceError> {
        let candidates = self.list_active(map_id).await?;
        if candidates.is_empty() {
            // nothing lives here anymore, drop the map from the index
            let mut conn = self.conn.clone();
            let map_id = map_id.to_string();
            self.with_timeout("presence map index prune", async move {
                conn.srem::<_, _, ()>(Self::MAPS_KEY, map_id).await
            })
            .await?;
            return Ok(Vec::new());
        }
        let cutoff = Timestamp::now()
            .as_millis()
            .saturating_sub(idle_threshold.as_millis() as u64);
        let map_key = Self::map_key(map_id);
        let mut reaped = Vec::new();
        for session in candidates {
            if session.last_active.as_millis() >= cutoff {
                continue;
            }
            let mut conn = self.conn.clone();
            let session_key = Self::session_key(session.id);
            let map_key = map_key.clone();
            let session_id = session.id.to_string();
            let removed: i64 = self
                .with_timeout("presence reap", async move {
                    self.reap_one_script
                        .key(session_key)
                        .key(map_key)
                        .arg(session_id)
                        .arg(cutoff)
                        .invoke_async(&mut conn)
                        .await
                })
                .await?;
            if removed == 1 {
                reaped.push(session);
            }
        }
        Ok(reaped)
    }
}
