//! TTL'd session presence store.
//!
//! This module defines the [`PresenceStore`] trait, the authoritative
//! ephemeral "who is where" state for live sessions. Heartbeats and
//! liveness-implying activity keep the TTL fresh; abandoned entries expire
//! or are collected by the reaper.
//!
//! Current `PresenceStore` implementations:
//! - [`MemoryPresenceStore`] (process-local, single-node and tests)
//! - Redis (cross-node, feature `redis`)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use plaza_types::{MapId, PoiId, Position, Session, SessionId, Timestamp};

#[cfg(feature = "redis")]
pub mod redis;

/// Dynamic trait object for the presence store service.
///
/// Must be `Send + Sync` to work with async contexts (e.g., Axum).
pub type PresenceService = Arc<dyn PresenceStore + Send + Sync>;

/// All errors a presence operation may produce.
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    /// The session is absent or its TTL expired.
    #[error("session {0} not found")]
    NotFound(SessionId),
    /// The backing store failed or timed out.
    #[error("presence store error: {0}")]
    Store(#[source] eyre::Error),
}

/// Authoritative ephemeral state for live sessions.
///
/// All mutations on one session id are serialized by the implementation;
/// cross-session operations need no ordering guarantees.
#[async_trait]
pub trait PresenceStore {
    /// Upserts the session with the provided TTL.
    async fn put(&self, session: Session, ttl: Duration) -> Result<(), PresenceError>;

    /// Reads a live session.
    async fn get(&self, session_id: SessionId) -> Result<Session, PresenceError>;

    /// Extends the TTL and bumps `last_active` to now.
    async fn touch(&self, session_id: SessionId, ttl: Duration) -> Result<(), PresenceError>;

    /// Mutates the position and `last_active` atomically, preserving the TTL.
    async fn update_position(
        &self,
        session_id: SessionId,
        position: Position,
    ) -> Result<(), PresenceError>;

    /// Mutates `current_poi` and `last_active` atomically, preserving the TTL.
    async fn set_current_poi(
        &self,
        session_id: SessionId,
        poi: Option<PoiId>,
    ) -> Result<(), PresenceError>;

    /// Removes the session. Removing an absent session is not an error.
    async fn remove(&self, session_id: SessionId) -> Result<(), PresenceError>;

    /// Lists the live sessions of a map.
    async fn list_active(&self, map_id: &MapId) -> Result<Vec<Session>, PresenceError>;

    /// Lists the maps that currently have at least one live session.
    async fn active_maps(&self) -> Result<Vec<MapId>, PresenceError>;

    /// Removes every session of the map whose `last_active` is older than
    /// `idle_threshold` and returns the removed sessions so the caller can
    /// publish the mandated departure notifications.
    async fn reap(
        &self,
        map_id: &MapId,
        idle_threshold: Duration,
    ) -> Result<Vec<Session>, PresenceError>;
}

struct Entry {
    session: Session,
    expires_at: Instant,
}

/// Process-local presence store.
#[derive(Default)]
pub struct MemoryPresenceStore {
    entries: Mutex<HashMap<SessionId, Entry>>,
}

impl MemoryPresenceStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `mutate` on the live entry, bumping `last_active`.
    fn mutate_live(
        &self,
        session_id: SessionId,
        mutate: impl FnOnce(&mut Entry),
    ) -> Result<(), PresenceError> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&session_id) else {
            return Err(PresenceError::NotFound(session_id));
        };
        if entry.expires_at <= Instant::now() {
            entries.remove(&session_id);
            return Err(PresenceError::NotFound(session_id));
        }
        // wall-clock regressions must not break the monotonicity invariant
        entry.session.last_active = entry.session.last_active.max(Timestamp::now());
        mutate(entry);
        Ok(())
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn put(&self, session: Session, ttl: Duration) -> Result<(), PresenceError> {
        self.entries.lock().insert(
            session.id,
            Entry {
                session,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, session_id: SessionId) -> Result<Session, PresenceError> {
        let mut entries = self.entries.lock();
        match entries.get(&session_id) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(entry.session.clone()),
            Some(_) => {
                entries.remove(&session_id);
                Err(PresenceError::NotFound(session_id))
            }
            None => Err(PresenceError::NotFound(session_id)),
        }
    }

    async fn touch(&self, session_id: SessionId, ttl: Duration) -> Result<(), PresenceError> {
        self.mutate_live(session_id, |entry| {
            entry.expires_at = Instant::now() + ttl;
        })
    }

    async fn update_position(
        &self,
        session_id: SessionId,
        position: Position,
    ) -> Result<(), PresenceError> {
        self.mutate_live(session_id, |entry| {
            entry.session.position = position;
        })
    }

    async fn set_current_poi(
        &self,
        session_id: SessionId,
        poi: Option<PoiId>,
    ) -> Result<(), PresenceError> {
        self.mutate_live(session_id, |entry| {
            entry.session.current_poi = poi;
        })
    }

    async fn remove(&self, session_id: SessionId) -> Result<(), PresenceError> {
        self.entries.lock().remove(&session_id);
        Ok(())
    }

    async fn list_active(&self, map_id: &MapId) -> Result<Vec<Session>, PresenceError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(entries
            .values()
            .filter(|entry| &entry.session.map_id == map_id)
            .map(|entry| entry.session.clone())
            .collect())
    }

    async fn active_maps(&self) -> Result<Vec<MapId>, PresenceError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.expires_at > now);
        let mut maps: Vec<MapId> = entries
            .values()
            .map(|entry| entry.session.map_id.clone())
            .collect();
        maps.sort();
        maps.dedup();
        Ok(maps)
    }

    async fn reap(
        &self,
        map_id: &MapId,
        idle_threshold: Duration,
    ) -> Result<Vec<Session>, PresenceError> {
        let cutoff = Timestamp::now()
            .as_millis()
            .saturating_sub(idle_threshold.as_millis() as u64);
        let mut entries = self.entries.lock();
        let stale: Vec<SessionId> = entries
            .values()
            .filter(|entry| {
                &entry.session.map_id == map_id && entry.session.last_active.as_millis() < cutoff
            })
            .map(|entry| entry.session.id)
            .collect();
        Ok(stale
            .into_iter()
            .filter_map(|id| entries.remove(&id))
            .map(|entry| entry.session)
            .collect())
    }
}
