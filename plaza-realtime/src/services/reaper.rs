//! Background removal of abandoned sessions.
//!
//! This module provides [`reaper_task`], a task the service builder spawns
//! to sweep every active map on an interval. Sessions whose `last_active`
//! exceeds the idle threshold are dissolved exactly like a disconnect:
//! their POI memberships drop (with `poi_left` and `group_call_peer_left`
//! notifications), their presence is removed, and the map learns about the
//! departure via `user_left`.
//!
//! Every mutation along the way is idempotent, so the task can be cancelled
//! at any await point and partial progress is safe.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use plaza_types::api::v1::{GroupCallPeer, PoiMembershipChange, ServerEvent, UserLeft};
use tokio_util::sync::CancellationToken;

use crate::metrics::METRICS_ID_NODE_SESSIONS_REAPED;
use crate::services::event_bus::{BusEnvelope, EventBus as _, EventBusService};
use crate::services::poi_registry::{PoiRegistry as _, PoiRegistryService};
use crate::services::presence::{PresenceService, PresenceStore as _};

/// The arguments to start the reaper.
pub(crate) struct ReaperTaskArgs {
    pub(crate) presence: PresenceService,
    pub(crate) registry: PoiRegistryService,
    pub(crate) bus: EventBusService,
    pub(crate) sweep_interval: Duration,
    pub(crate) idle_threshold: Duration,
    pub(crate) started: Arc<AtomicBool>,
    pub(crate) cancellation_token: CancellationToken,
}

/// Background task that periodically removes abandoned sessions.
///
/// If the task ends, the attached drop guard cancels the provided token so
/// the hosting application can shut down gracefully.
pub(crate) async fn reaper_task(args: ReaperTaskArgs) -> eyre::Result<()> {
    // shutdown service if the reaper dies and drops this guard
    let cancellation_token = args.cancellation_token.clone();
    let _drop_guard = cancellation_token.drop_guard_ref();

    tracing::info!("start reaping stale sessions");
    let result = run(args).await;
    match result.as_ref() {
        Ok(_) => tracing::info!("stopped reaper without error"),
        Err(err) => tracing::warn!("reaper encountered an error: {err:?}"),
    };
    result
}

async fn run(args: ReaperTaskArgs) -> eyre::Result<()> {
    let ReaperTaskArgs {
        presence,
        registry,
        bus,
        sweep_interval,
        idle_threshold,
        started,
        cancellation_token,
    } = args;
    let mut interval = tokio::time::interval(sweep_interval);
    // first tick triggers instantly
    interval.tick().await;
    tracing::info!("reaper is ready");
    started.store(true, Ordering::Relaxed);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancellation_token.cancelled() => break,
        }
        // store blips must not kill the service; the next tick retries
        if let Err(err) = sweep(&presence, &registry, &bus, idle_threshold).await {
            tracing::warn!("reaper sweep failed: {err:?}");
        }
    }
    Ok(())
}

/// One pass over every active map.
pub(crate) async fn sweep(
    presence: &PresenceService,
    registry: &PoiRegistryService,
    bus: &EventBusService,
    idle_threshold: Duration,
) -> eyre::Result<()> {
    for map_id in presence.active_maps().await? {
        let reaped = presence.reap(&map_id, idle_threshold).await?;
        if reaped.is_empty() {
            continue;
        }
        tracing::info!("reaping {} stale sessions on map {map_id}", reaped.len());
        for session in reaped {
            ::metrics::counter!(METRICS_ID_NODE_SESSIONS_REAPED).increment(1);
            match registry.remove_from_all(session.id).await {
                Ok(affected) => {
                    for (poi_id, count) in affected {
                        bus.publish(
                            &map_id,
                            BusEnvelope::broadcast(ServerEvent::PoiLeft(PoiMembershipChange {
                                poi_id: poi_id.clone(),
                                session_id: session.id,
                                user_id: session.user_id.clone(),
                                current_count: count,
                            })),
                        )
                        .await;
                        if count > 0 {
                            let members = registry.members(&poi_id).await?;
                            bus.publish(
                                &map_id,
                                BusEnvelope::targeted(
                                    ServerEvent::GroupCallPeerLeft(GroupCallPeer {
                                        poi_id,
                                        peer_id: session.user_id.clone(),
                                    }),
                                    members,
                                ),
                            )
                            .await;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        "could not dissolve POI memberships of reaped session {}: {err:?}",
                        session.id
                    );
                }
            }
            bus.publish(
                &map_id,
                BusEnvelope::broadcast(ServerEvent::UserLeft(UserLeft {
                    session_id: session.id,
                    user_id: session.user_id.clone(),
                })),
            )
            .await;
        }
    }
    Ok(())
}
