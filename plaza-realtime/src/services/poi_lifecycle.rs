//! POI create/update/delete announcements.
//!
//! POI metadata is durable in an external store; this handle is the piece
//! the hosting HTTP layer calls after that store acknowledged a change, so
//! the live map learns about it. Deletion additionally dissolves the live
//! participant set: members are evicted, their sessions reset to IDLE, and
//! the `poi_deleted` event carries the evicted list so clients can tear
//! down their calls.

use eyre::Context as _;
use plaza_types::api::v1::{PoiDeleted, PoiSummary, ServerEvent};
use plaza_types::{MapId, PoiId, SessionId};

use crate::services::event_bus::{BusEnvelope, EventBus as _, EventBusService};
use crate::services::poi_registry::{PoiRegistry as _, PoiRegistryService};
use crate::services::presence::{PresenceError, PresenceService, PresenceStore as _};

/// Host-facing handle publishing POI lifecycle events.
#[derive(Clone)]
pub struct PoiLifecycle {
    registry: PoiRegistryService,
    presence: PresenceService,
    bus: EventBusService,
}

impl PoiLifecycle {
    /// Builds the handle over the shared services.
    pub fn new(
        registry: PoiRegistryService,
        presence: PresenceService,
        bus: EventBusService,
    ) -> Self {
        Self {
            registry,
            presence,
            bus,
        }
    }

    /// Announces a freshly created POI to the map.
    pub async fn announce_created(&self, map_id: &MapId, summary: PoiSummary) {
        self.bus
            .publish(
                map_id,
                BusEnvelope::broadcast(ServerEvent::PoiCreated(summary)),
            )
            .await;
    }

    /// Announces changed POI metadata to the map.
    pub async fn announce_updated(&self, map_id: &MapId, summary: PoiSummary) {
        self.bus
            .publish(
                map_id,
                BusEnvelope::broadcast(ServerEvent::PoiUpdated(summary)),
            )
            .await;
    }

    /// Dissolves a deleted POI.
    ///
    /// Evicts every member, resets their sessions to IDLE and publishes
    /// `poi_deleted` carrying the evicted session ids. The registry lays a
    /// tombstone so a join racing the deletion is rejected.
    pub async fn delete(&self, map_id: &MapId, poi_id: &PoiId) -> eyre::Result<Vec<SessionId>> {
        let evicted = self
            .registry
            .clear(poi_id)
            .await
            .context("while clearing the participant set")?;
        for session_id in &evicted {
            match self.presence.set_current_poi(*session_id, None).await {
                Ok(()) => {}
                // an evicted session may have expired already
                Err(PresenceError::NotFound(_)) => {}
                Err(err) => {
                    tracing::warn!("could not reset current_poi of {session_id}: {err:?}");
                }
            }
        }
        self.bus
            .publish(
                map_id,
                BusEnvelope::broadcast(ServerEvent::PoiDeleted(PoiDeleted {
                    poi_id: poi_id.clone(),
                    evicted: evicted.clone(),
                })),
            )
            .await;
        Ok(evicted)
    }
}
