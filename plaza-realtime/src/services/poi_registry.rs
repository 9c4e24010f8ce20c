//! Atomic capacity-bounded POI membership.
//!
//! This module defines the [`PoiRegistry`] trait, the authoritative live
//! participant sets of POIs. Every operation is atomic: "check then add"
//! is indivisible, so two joins racing on the last slot resolve to exactly
//! one winner no matter how many backend nodes share the store.
//!
//! The single-POI rule (a session holds at most one POI at a time) is
//! enforced by the router, which calls [`PoiRegistry::move_membership`]
//! whenever the session already occupies a POI.
//!
//! Current `PoiRegistry` implementations:
//! - [`MemoryPoiRegistry`] (process-local, single-node and tests)
//! - Redis (cross-node, feature `redis`; Lua scripts make the compound
//!   operations store-side atomic)

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use plaza_types::{PoiId, SessionId};

#[cfg(feature = "redis")]
pub mod redis;

/// Dynamic trait object for the POI registry service.
///
/// Must be `Send + Sync` to work with async contexts (e.g., Axum).
pub type PoiRegistryService = Arc<dyn PoiRegistry + Send + Sync>;

/// All errors a registry operation may produce.
#[derive(Debug, thiserror::Error)]
pub enum PoiRegistryError {
    /// The backing store failed or timed out.
    #[error("poi registry store error: {0}")]
    Store(#[source] eyre::Error),
}

/// Outcome of a [`PoiRegistry::join`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The session was added; `count` is the post-join participant count.
    Joined {
        /// Participant count right after the join.
        count: u32,
    },
    /// The session already was a member; nothing changed.
    AlreadyMember {
        /// Current participant count.
        count: u32,
    },
    /// The POI is full; nothing changed.
    CapacityExceeded {
        /// Current participant count.
        count: u32,
    },
    /// The POI was deleted; joins are rejected.
    Deleted,
}

/// Outcome of a [`PoiRegistry::leave`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The session was removed; `count` is the post-leave count.
    Left {
        /// Participant count right after the leave.
        count: u32,
    },
    /// The session was not a member; leaving is idempotent, not an error.
    NotMember,
}

/// Outcome of a [`PoiRegistry::move_membership`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The session switched POIs in one atomic step.
    Moved {
        /// Participant count of the origin right after the move.
        from_count: u32,
        /// Participant count of the destination right after the move.
        to_count: u32,
    },
    /// The session already was a member of the destination.
    AlreadyMember {
        /// Current participant count of the destination.
        count: u32,
    },
    /// The destination is full; the origin membership is untouched.
    CapacityExceeded {
        /// Current participant count of the destination.
        count: u32,
    },
    /// The destination was deleted; the origin membership is untouched.
    Deleted,
}

/// Authoritative live POI membership.
#[async_trait]
pub trait PoiRegistry {
    /// Adds the session if the POI holds fewer than `max` participants.
    async fn join(
        &self,
        poi_id: &PoiId,
        session_id: SessionId,
        max: u32,
    ) -> Result<JoinOutcome, PoiRegistryError>;

    /// Removes the session. Idempotent.
    async fn leave(
        &self,
        poi_id: &PoiId,
        session_id: SessionId,
    ) -> Result<LeaveOutcome, PoiRegistryError>;

    /// Leaves `from` and joins `to` as one atomic compound; a capacity
    /// failure on `to` leaves the `from` membership intact.
    async fn move_membership(
        &self,
        from: &PoiId,
        to: &PoiId,
        session_id: SessionId,
        to_max: u32,
    ) -> Result<MoveOutcome, PoiRegistryError>;

    /// Current participant count.
    async fn count(&self, poi_id: &PoiId) -> Result<u32, PoiRegistryError>;

    /// Current participant set.
    async fn members(&self, poi_id: &PoiId) -> Result<Vec<SessionId>, PoiRegistryError>;

    /// Whether the session currently occupies the POI.
    async fn is_member(
        &self,
        poi_id: &PoiId,
        session_id: SessionId,
    ) -> Result<bool, PoiRegistryError>;

    /// Whether a join with the given capacity bound would currently succeed.
    async fn can_join(&self, poi_id: &PoiId, max: u32) -> Result<bool, PoiRegistryError>;

    /// Removes the session from every POI it occupies (disconnect path).
    ///
    /// Returns the affected POIs with their post-leave counts so the caller
    /// can publish the mandated `poi_left` notifications.
    async fn remove_from_all(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<(PoiId, u32)>, PoiRegistryError>;

    /// Empties the POI on deletion and lays a tombstone so late joins are
    /// rejected. Returns the evicted session ids for notification.
    async fn clear(&self, poi_id: &PoiId) -> Result<Vec<SessionId>, PoiRegistryError>;
}

#[derive(Default)]
struct RegistryInner {
    members: HashMap<PoiId, HashSet<SessionId>>,
    by_session: HashMap<SessionId, HashSet<PoiId>>,
    deleted: HashSet<PoiId>,
}

impl RegistryInner {
    fn count(&self, poi_id: &PoiId) -> u32 {
        self.members.get(poi_id).map_or(0, |set| set.len() as u32)
    }

    fn insert(&mut self, poi_id: &PoiId, session_id: SessionId) -> u32 {
        self.members
            .entry(poi_id.clone())
            .or_default()
            .insert(session_id);
        self.by_session
            .entry(session_id)
            .or_default()
            .insert(poi_id.clone());
        self.count(poi_id)
    }

    fn remove(&mut self, poi_id: &PoiId, session_id: SessionId) -> Option<u32> {
        let set = self.members.get_mut(poi_id)?;
        if !set.remove(&session_id) {
            return None;
        }
        if set.is_empty() {
            self.members.remove(poi_id);
        }
        if let Some(pois) = self.by_session.get_mut(&session_id) {
            pois.remove(poi_id);
            if pois.is_empty() {
                self.by_session.remove(&session_id);
            }
        }
        Some(self.count(poi_id))
    }
}

/// Process-local POI registry.
///
/// A single mutex over the whole state makes every operation, including the
/// compound move, trivially atomic. Sufficient for one node; multi-node
/// deployments need the store-backed implementation.
#[derive(Default)]
pub struct MemoryPoiRegistry {
    inner: Mutex<RegistryInner>,
}

impl MemoryPoiRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PoiRegistry for MemoryPoiRegistry {
    async fn join(
        &self,
        poi_id: &PoiId,
        session_id: SessionId,
        max: u32,
    ) -> Result<JoinOutcome, PoiRegistryError> {
        let mut inner = self.inner.lock();
        if inner.deleted.contains(poi_id) {
            return Ok(JoinOutcome::Deleted);
        }
        if inner
            .members
            .get(poi_id)
            .is_some_and(|set| set.contains(&session_id))
        {
            return Ok(JoinOutcome::AlreadyMember {
                count: inner.count(poi_id),
            });
        }
        if inner.count(poi_id) >= max {
            return Ok(JoinOutcome::CapacityExceeded {
                count: inner.count(poi_id),
            });
        }
        let count = inner.insert(poi_id, session_id);
        Ok(JoinOutcome::Joined { count })
    }

    async fn leave(
        &self,
        poi_id: &PoiId,
        session_id: SessionId,
    ) -> Result<LeaveOutcome, PoiRegistryError> {
        let mut inner = self.inner.lock();
        match inner.remove(poi_id, session_id) {
            Some(count) => Ok(LeaveOutcome::Left { count }),
            None => Ok(LeaveOutcome::NotMember),
        }
    }

    async fn move_membership(
        &self,
        from: &PoiId,
        to: &PoiId,
        session_id: SessionId,
        to_max: u32,
    ) -> Result<MoveOutcome, PoiRegistryError> {
        let mut inner = self.inner.lock();
        if inner.deleted.contains(to) {
            return Ok(MoveOutcome::Deleted);
        }
        if inner
            .members
            .get(to)
            .is_some_and(|set| set.contains(&session_id))
        {
            return Ok(MoveOutcome::AlreadyMember {
                count: inner.count(to),
            });
        }
        if inner.count(to) >= to_max {
            return Ok(MoveOutcome::CapacityExceeded {
                count: inner.count(to),
            });
        }
        let from_count = match inner.remove(from, session_id) {
            Some(count) => count,
            None => inner.count(from),
        };
        let to_count = inner.insert(to, session_id);
        Ok(MoveOutcome::Moved {
            from_count,
            to_count,
        })
    }

    async fn count(&self, poi_id: &PoiId) -> Result<u32, PoiRegistryError> {
        Ok(self.inner.lock().count(poi_id))
    }

    async fn members(&self, poi_id: &PoiId) -> Result<Vec<SessionId>, PoiRegistryError> {
        Ok(self
            .inner
            .lock()
            .members
            .get(poi_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn is_member(
        &self,
        poi_id: &PoiId,
        session_id: SessionId,
    ) -> Result<bool, PoiRegistryError> {
        Ok(self
            .inner
            .lock()
            .members
            .get(poi_id)
            .is_some_and(|set| set.contains(&session_id)))
    }

    async fn can_join(&self, poi_id: &PoiId, max: u32) -> Result<bool, PoiRegistryError> {
        let inner = self.inner.lock();
        Ok(!inner.deleted.contains(poi_id) && inner.count(poi_id) < max)
    }

    async fn remove_from_all(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<(PoiId, u32)>, PoiRegistryError> {
        let mut inner = self.inner.lock();
        let pois: Vec<PoiId> = inner
            .by_session
            .get(&session_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        Ok(pois
            .into_iter()
            .filter_map(|poi| {
                let count = inner.remove(&poi, session_id)?;
                Some((poi, count))
            })
            .collect())
    }

    async fn clear(&self, poi_id: &PoiId) -> Result<Vec<SessionId>, PoiRegistryError> {
        let mut inner = self.inner.lock();
        let evicted: Vec<SessionId> = inner
            .members
            .remove(poi_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for session_id in &evicted {
            if let Some(pois) = inner.by_session.get_mut(session_id) {
                pois.remove(poi_id);
                if pois.is_empty() {
                    inner.by_session.remove(session_id);
                }
            }
        }
        inner.deleted.insert(poi_id.clone());
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poi(id: &str) -> PoiId {
        PoiId::from(id)
    }

    #[tokio::test]
    async fn join_enforces_capacity() {
        let registry = MemoryPoiRegistry::new();
        let a = SessionId::random();
        let b = SessionId::random();
        let c = SessionId::random();
        assert_eq!(
            registry.join(&poi("p"), a, 2).await.unwrap(),
            JoinOutcome::Joined { count: 1 }
        );
        assert_eq!(
            registry.join(&poi("p"), b, 2).await.unwrap(),
            JoinOutcome::Joined { count: 2 }
        );
        assert_eq!(
            registry.join(&poi("p"), c, 2).await.unwrap(),
            JoinOutcome::CapacityExceeded { count: 2 }
        );
        // a leave immediately frees the slot
        assert_eq!(
            registry.leave(&poi("p"), a).await.unwrap(),
            LeaveOutcome::Left { count: 1 }
        );
        assert_eq!(
            registry.join(&poi("p"), c, 2).await.unwrap(),
            JoinOutcome::Joined { count: 2 }
        );
    }

    #[tokio::test]
    async fn join_and_leave_are_idempotent() {
        let registry = MemoryPoiRegistry::new();
        let a = SessionId::random();
        registry.join(&poi("p"), a, 5).await.unwrap();
        assert_eq!(
            registry.join(&poi("p"), a, 5).await.unwrap(),
            JoinOutcome::AlreadyMember { count: 1 }
        );
        assert_eq!(
            registry.leave(&poi("p"), a).await.unwrap(),
            LeaveOutcome::Left { count: 0 }
        );
        assert_eq!(
            registry.leave(&poi("p"), a).await.unwrap(),
            LeaveOutcome::NotMember
        );
    }

    #[tokio::test]
    async fn move_round_trip_does_not_drift_counts() {
        let registry = MemoryPoiRegistry::new();
        let a = SessionId::random();
        let bystander = SessionId::random();
        registry.join(&poi("a"), a, 5).await.unwrap();
        registry.join(&poi("b"), bystander, 5).await.unwrap();

        assert_eq!(
            registry.move_membership(&poi("a"), &poi("b"), a, 5).await.unwrap(),
            MoveOutcome::Moved {
                from_count: 0,
                to_count: 2
            }
        );
        assert_eq!(
            registry.move_membership(&poi("b"), &poi("a"), a, 5).await.unwrap(),
            MoveOutcome::Moved {
                from_count: 1,
                to_count: 1
            }
        );
        assert_eq!(registry.count(&poi("a")).await.unwrap(), 1);
        assert_eq!(registry.count(&poi("b")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn move_into_full_poi_keeps_origin_membership() {
        let registry = MemoryPoiRegistry::new();
        let a = SessionId::random();
        let b = SessionId::random();
        registry.join(&poi("a"), a, 5).await.unwrap();
        registry.join(&poi("b"), b, 1).await.unwrap();
        assert_eq!(
            registry.move_membership(&poi("a"), &poi("b"), a, 1).await.unwrap(),
            MoveOutcome::CapacityExceeded { count: 1 }
        );
        assert!(registry.is_member(&poi("a"), a).await.unwrap());
        assert!(!registry.is_member(&poi("b"), a).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_joins_on_last_slot_admit_exactly_one() {
        let registry = Arc::new(MemoryPoiRegistry::new());
        registry.join(&poi("p"), SessionId::random(), 2).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.join(&poi("p"), SessionId::random(), 2).await.unwrap()
            }));
        }
        let mut joined = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                JoinOutcome::Joined { count } => {
                    joined += 1;
                    assert_eq!(count, 2);
                }
                JoinOutcome::CapacityExceeded { count } => {
                    rejected += 1;
                    assert_eq!(count, 2);
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(joined, 1);
        assert_eq!(rejected, 7);
        assert_eq!(registry.count(&poi("p")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn remove_from_all_reports_affected_pois() {
        let registry = MemoryPoiRegistry::new();
        let a = SessionId::random();
        let b = SessionId::random();
        registry.join(&poi("p"), a, 5).await.unwrap();
        registry.join(&poi("p"), b, 5).await.unwrap();
        let affected = registry.remove_from_all(a).await.unwrap();
        assert_eq!(affected, vec![(poi("p"), 1)]);
        assert_eq!(registry.remove_from_all(a).await.unwrap(), vec![]);
    }

    #[tokio::test]
    async fn clear_evicts_members_and_rejects_late_joins() {
        let registry = MemoryPoiRegistry::new();
        let a = SessionId::random();
        let b = SessionId::random();
        registry.join(&poi("p"), a, 5).await.unwrap();
        registry.join(&poi("p"), b, 5).await.unwrap();
        let mut evicted = registry.clear(&poi("p")).await.unwrap();
        evicted.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(evicted, expected);
        assert_eq!(
            registry.join(&poi("p"), SessionId::random(), 5).await.unwrap(),
            JoinOutcome::Deleted
        );
        assert!(!registry.can_join(&poi("p"), 5).await.unwrap());
    }
}
