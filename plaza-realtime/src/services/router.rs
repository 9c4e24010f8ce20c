//! Inbound frame dispatch, validation, rate limiting and state mutation.
//!
//! One router instance serves every connection; the websocket layer hands it
//! decoded frames together with the connection identity. Handlers return the
//! most specific [`HandlerError`] kind and the router maps kinds to wire
//! codes, so every failure a client can cause has a deterministic code.
//!
//! POI membership follows a two-state machine per session, IDLE and
//! IN_POI(p). The router, not the registry, enforces the single-POI rule: a
//! join while IN_POI(p) is executed as one atomic registry move, so no
//! interleaving can observe a session in two POIs, and a capacity failure
//! leaves both the registry and the session record untouched.

use std::sync::Arc;
use std::time::Duration;

use plaza_types::api::v1::{
    AvatarMove, AvatarMoved, ClientFrame, ErrorFrame, PoiJoinRequest, PoiMembershipChange,
    ServerEvent, error_codes,
};
use plaza_types::{PoiId, Session, SessionId};

use crate::metrics::METRICS_ID_NODE_FRAMES_INBOUND;
use crate::services::event_bus::{BusEnvelope, EventBus as _, EventBusService};
use crate::services::poi_registry::{
    JoinOutcome, LeaveOutcome, MoveOutcome, PoiRegistry as _, PoiRegistryError, PoiRegistryService,
};
use crate::services::presence::{PresenceError, PresenceService, PresenceStore as _};
use crate::services::rate_limiter::{
    RateAction, RateLimitError, RateLimiter as _, RateLimiterService,
};
use crate::services::signaling::{DirectSignalKind, GroupSignalKind, SignalingError, SignalingRelay};

/// Identity of the connection a frame arrived on, snapshotted at upgrade.
#[derive(Clone, Debug)]
pub struct ConnectionContext {
    /// The session bound to the connection.
    pub session_id: SessionId,
    /// The user owning the session.
    pub user_id: plaza_types::UserId,
    /// The map the connection subscribes to.
    pub map_id: plaza_types::MapId,
}

impl ConnectionContext {
    /// Snapshots the identity of a session.
    pub fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.id,
            user_id: session.user_id.clone(),
            map_id: session.map_id.clone(),
        }
    }
}

/// The error kinds a frame handler can produce.
///
/// Each kind has a deterministic wire code (see [`HandlerError::error_frame`]);
/// clients use the code to decide whether to retry, reconcile, or surface the
/// problem to the user.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Malformed payload or out-of-range value. No state was mutated.
    #[error("{0}")]
    Validation(String),
    /// The per-user bucket for the action is depleted.
    #[error("rate limit for {action} exceeded")]
    RateLimited {
        /// The denied action.
        action: RateAction,
        /// Until the window resets; absent when the action has no quota.
        retry_after: Option<Duration>,
    },
    /// The session vanished from the presence store.
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    /// The POI was deleted.
    #[error("poi {0} not found")]
    PoiNotFound(PoiId),
    /// The POI is full.
    #[error("poi {poi_id} is at capacity ({count})")]
    PoiCapacity {
        /// The full POI.
        poi_id: PoiId,
        /// Its current participant count.
        count: u32,
    },
    /// The signaling target has no live session on the map.
    #[error("user {0} is unreachable")]
    CallUnreachable(plaza_types::UserId),
    /// A store or bus operation failed.
    #[error(transparent)]
    Internal(eyre::Error),
}

impl HandlerError {
    /// The in-band error frame reported to the requester.
    ///
    /// Internal details are logged, never sent.
    pub fn error_frame(&self) -> ErrorFrame {
        match self {
            HandlerError::Validation(message) => {
                ErrorFrame::new(error_codes::INVALID_REQUEST, message.clone())
            }
            HandlerError::RateLimited {
                action,
                retry_after,
            } => {
                let mut frame = ErrorFrame::new(
                    error_codes::RATE_LIMIT_EXCEEDED,
                    format!("rate limit for {action} exceeded"),
                );
                frame.retry_after = retry_after.map(|d| d.as_secs().max(1));
                frame
            }
            HandlerError::SessionNotFound(session_id) => ErrorFrame::new(
                error_codes::SESSION_NOT_FOUND,
                format!("session {session_id} not found"),
            ),
            HandlerError::PoiNotFound(poi_id) => ErrorFrame::new(
                error_codes::POI_NOT_FOUND,
                format!("poi {poi_id} not found"),
            ),
            HandlerError::PoiCapacity { poi_id, .. } => ErrorFrame::new(
                error_codes::POI_CAPACITY,
                format!("poi {poi_id} is at capacity"),
            ),
            HandlerError::CallUnreachable(user_id) => ErrorFrame::new(
                error_codes::CALL_UNREACHABLE,
                format!("user {user_id} is unreachable"),
            ),
            HandlerError::Internal(err) => {
                tracing::error!("internal error while handling frame: {err:?}");
                ErrorFrame::new(error_codes::INTERNAL_ERROR, "internal error")
            }
        }
    }

    /// Whether this is an infrastructure failure (feeds the per-connection
    /// failure-storm threshold).
    pub fn is_infra(&self) -> bool {
        matches!(self, HandlerError::Internal(_))
    }
}

impl From<PresenceError> for HandlerError {
    fn from(value: PresenceError) -> Self {
        match value {
            PresenceError::NotFound(session_id) => HandlerError::SessionNotFound(session_id),
            PresenceError::Store(err) => HandlerError::Internal(err),
        }
    }
}

impl From<PoiRegistryError> for HandlerError {
    fn from(value: PoiRegistryError) -> Self {
        match value {
            PoiRegistryError::Store(err) => HandlerError::Internal(err),
        }
    }
}

impl From<RateLimitError> for HandlerError {
    fn from(value: RateLimitError) -> Self {
        match value {
            RateLimitError::Exceeded {
                action,
                retry_after,
            } => HandlerError::RateLimited {
                action,
                retry_after: Some(retry_after),
            },
            RateLimitError::Denied(action) => HandlerError::RateLimited {
                action,
                retry_after: None,
            },
            RateLimitError::Store(err) => HandlerError::Internal(err),
        }
    }
}

impl From<SignalingError> for HandlerError {
    fn from(value: SignalingError) -> Self {
        match value {
            SignalingError::Unreachable(user_id) => HandlerError::CallUnreachable(user_id),
            SignalingError::NotCoLocated(user_id) => {
                HandlerError::Validation(format!("user {user_id} does not share your POI"))
            }
            SignalingError::Registry(err) => err.into(),
            SignalingError::Presence(err) => err.into(),
        }
    }
}

/// Arguments to construct the [`MessageRouter`].
pub struct RouterArgs {
    /// Presence store for session state.
    pub presence: PresenceService,
    /// Registry for POI membership.
    pub registry: PoiRegistryService,
    /// Limiter gating expensive actions.
    pub rate_limiter: RateLimiterService,
    /// Bus for map-wide publications.
    pub bus: EventBusService,
    /// Relay for call signaling (owns the hub handle for local delivery).
    pub relay: SignalingRelay,
    /// TTL applied on heartbeats and liveness-implying activity.
    pub session_ttl: Duration,
}

struct RouterInner {
    presence: PresenceService,
    registry: PoiRegistryService,
    rate_limiter: RateLimiterService,
    bus: EventBusService,
    relay: SignalingRelay,
    session_ttl: Duration,
}

/// Dispatches decoded inbound frames.
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

impl MessageRouter {
    /// Builds the router over the shared services.
    pub fn new(args: RouterArgs) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                presence: args.presence,
                registry: args.registry,
                rate_limiter: args.rate_limiter,
                bus: args.bus,
                relay: args.relay,
                session_ttl: args.session_ttl,
            }),
        }
    }

    /// Handles one decoded frame on behalf of a connection.
    pub async fn handle_frame(
        &self,
        ctx: &ConnectionContext,
        frame: ClientFrame,
    ) -> Result<(), HandlerError> {
        ::metrics::counter!(METRICS_ID_NODE_FRAMES_INBOUND).increment(1);
        match frame {
            ClientFrame::Heartbeat => self.handle_heartbeat(ctx).await,
            ClientFrame::AvatarMove(movement) => self.handle_avatar_move(ctx, movement).await,
            ClientFrame::PoiJoined(request) => self.handle_poi_join(ctx, request).await,
            ClientFrame::PoiLeft => self.handle_poi_leave(ctx).await,
            ClientFrame::CallRequest(signal) => {
                self.relay_direct(ctx, DirectSignalKind::Request, signal).await
            }
            ClientFrame::CallAccept(signal) => {
                self.relay_direct(ctx, DirectSignalKind::Accept, signal).await
            }
            ClientFrame::CallReject(signal) => {
                self.relay_direct(ctx, DirectSignalKind::Reject, signal).await
            }
            ClientFrame::CallEnd(signal) => {
                self.relay_direct(ctx, DirectSignalKind::End, signal).await
            }
            ClientFrame::CallOffer(signal) => {
                self.relay_direct(ctx, DirectSignalKind::Offer, signal).await
            }
            ClientFrame::CallAnswer(signal) => {
                self.relay_direct(ctx, DirectSignalKind::Answer, signal).await
            }
            ClientFrame::CallIce(signal) => {
                self.relay_direct(ctx, DirectSignalKind::Ice, signal).await
            }
            ClientFrame::GroupCallOffer(signal) => {
                self.relay_group(ctx, GroupSignalKind::Offer, signal).await
            }
            ClientFrame::GroupCallAnswer(signal) => {
                self.relay_group(ctx, GroupSignalKind::Answer, signal).await
            }
            ClientFrame::GroupCallIce(signal) => {
                self.relay_group(ctx, GroupSignalKind::Ice, signal).await
            }
            ClientFrame::Error(report) => {
                tracing::warn!(
                    "client error from session {}: {} ({})",
                    ctx.session_id,
                    report.message,
                    report.code
                );
                Ok(())
            }
        }
    }

    async fn handle_heartbeat(&self, ctx: &ConnectionContext) -> Result<(), HandlerError> {
        let inner = &self.inner;
        inner
            .presence
            .touch(ctx.session_id, inner.session_ttl)
            .await?;
        Ok(())
    }

    async fn handle_avatar_move(
        &self,
        ctx: &ConnectionContext,
        movement: AvatarMove,
    ) -> Result<(), HandlerError> {
        let inner = &self.inner;
        if !movement.position.is_valid() {
            return Err(HandlerError::Validation(format!(
                "position ({}, {}) is out of range",
                movement.position.lat, movement.position.lng
            )));
        }
        inner
            .rate_limiter
            .check(&ctx.user_id, RateAction::UpdateAvatar)
            .await?;
        inner
            .presence
            .update_position(ctx.session_id, movement.position)
            .await?;
        inner
            .presence
            .touch(ctx.session_id, inner.session_ttl)
            .await?;
        inner
            .bus
            .publish(
                &ctx.map_id,
                BusEnvelope::excluding(
                    ServerEvent::AvatarMoved(AvatarMoved {
                        session_id: ctx.session_id,
                        user_id: ctx.user_id.clone(),
                        position: movement.position,
                    }),
                    ctx.session_id,
                ),
            )
            .await;
        Ok(())
    }

    async fn handle_poi_join(
        &self,
        ctx: &ConnectionContext,
        request: PoiJoinRequest,
    ) -> Result<(), HandlerError> {
        let inner = &self.inner;
        if request.max_participants == 0 {
            return Err(HandlerError::Validation(
                "max_participants must be at least 1".to_owned(),
            ));
        }
        inner
            .rate_limiter
            .check(&ctx.user_id, RateAction::JoinPoi)
            .await?;
        let session = self.get_session(ctx.session_id).await?;
        if session.current_poi.as_ref() == Some(&request.poi_id) {
            return Ok(());
        }

        // snapshot for the group-call choreography; the join itself stays
        // atomic in the registry
        let prior_members = inner.registry.members(&request.poi_id).await?;

        let (left, joined_count) = match &session.current_poi {
            Some(old_poi) => {
                match inner
                    .registry
                    .move_membership(old_poi, &request.poi_id, ctx.session_id, request.max_participants)
                    .await?
                {
                    MoveOutcome::Moved {
                        from_count,
                        to_count,
                    } => (Some((old_poi.clone(), from_count)), to_count),
                    MoveOutcome::AlreadyMember { .. } => {
                        // registry and session record disagreed; adopt the
                        // registry's view and dissolve the stale membership
                        if let LeaveOutcome::Left { count } =
                            inner.registry.leave(old_poi, ctx.session_id).await?
                        {
                            inner
                                .bus
                                .publish(
                                    &ctx.map_id,
                                    BusEnvelope::broadcast(ServerEvent::PoiLeft(
                                        PoiMembershipChange {
                                            poi_id: old_poi.clone(),
                                            session_id: ctx.session_id,
                                            user_id: ctx.user_id.clone(),
                                            current_count: count,
                                        },
                                    )),
                                )
                                .await;
                        }
                        inner
                            .presence
                            .set_current_poi(ctx.session_id, Some(request.poi_id.clone()))
                            .await?;
                        return Ok(());
                    }
                    MoveOutcome::CapacityExceeded { count } => {
                        return Err(HandlerError::PoiCapacity {
                            poi_id: request.poi_id,
                            count,
                        });
                    }
                    MoveOutcome::Deleted => {
                        return Err(HandlerError::PoiNotFound(request.poi_id));
                    }
                }
            }
            None => match inner
                .registry
                .join(&request.poi_id, ctx.session_id, request.max_participants)
                .await?
            {
                JoinOutcome::Joined { count } => (None, count),
                JoinOutcome::AlreadyMember { .. } => {
                    inner
                        .presence
                        .set_current_poi(ctx.session_id, Some(request.poi_id.clone()))
                        .await?;
                    return Ok(());
                }
                JoinOutcome::CapacityExceeded { count } => {
                    return Err(HandlerError::PoiCapacity {
                        poi_id: request.poi_id,
                        count,
                    });
                }
                JoinOutcome::Deleted => {
                    return Err(HandlerError::PoiNotFound(request.poi_id));
                }
            },
        };

        inner
            .presence
            .set_current_poi(ctx.session_id, Some(request.poi_id.clone()))
            .await?;
        inner
            .presence
            .touch(ctx.session_id, inner.session_ttl)
            .await?;

        if let Some((old_poi, from_count)) = &left {
            inner
                .bus
                .publish(
                    &ctx.map_id,
                    BusEnvelope::broadcast(ServerEvent::PoiLeft(PoiMembershipChange {
                        poi_id: old_poi.clone(),
                        session_id: ctx.session_id,
                        user_id: ctx.user_id.clone(),
                        current_count: *from_count,
                    })),
                )
                .await;
            inner
                .relay
                .announce_leave(&ctx.map_id, old_poi, &ctx.user_id)
                .await?;
        }
        inner
            .bus
            .publish(
                &ctx.map_id,
                BusEnvelope::broadcast(ServerEvent::PoiJoined(PoiMembershipChange {
                    poi_id: request.poi_id.clone(),
                    session_id: ctx.session_id,
                    user_id: ctx.user_id.clone(),
                    current_count: joined_count,
                })),
            )
            .await;
        inner
            .relay
            .announce_join(&session, &request.poi_id, &prior_members)
            .await?;
        Ok(())
    }

    async fn handle_poi_leave(&self, ctx: &ConnectionContext) -> Result<(), HandlerError> {
        let inner = &self.inner;
        let session = self.get_session(ctx.session_id).await?;
        let Some(poi_id) = session.current_poi else {
            // leaving while IDLE is allowed and changes nothing
            return Ok(());
        };
        let outcome = inner.registry.leave(&poi_id, ctx.session_id).await?;
        inner
            .presence
            .set_current_poi(ctx.session_id, None)
            .await?;
        inner
            .presence
            .touch(ctx.session_id, inner.session_ttl)
            .await?;
        if let LeaveOutcome::Left { count } = outcome {
            inner
                .bus
                .publish(
                    &ctx.map_id,
                    BusEnvelope::broadcast(ServerEvent::PoiLeft(PoiMembershipChange {
                        poi_id: poi_id.clone(),
                        session_id: ctx.session_id,
                        user_id: ctx.user_id.clone(),
                        current_count: count,
                    })),
                )
                .await;
            inner
                .relay
                .announce_leave(&ctx.map_id, &poi_id, &ctx.user_id)
                .await?;
        }
        Ok(())
    }

    async fn relay_direct(
        &self,
        ctx: &ConnectionContext,
        kind: DirectSignalKind,
        signal: plaza_types::api::v1::CallSignal,
    ) -> Result<(), HandlerError> {
        self.inner
            .relay
            .relay_direct(&ctx.user_id, &ctx.map_id, kind, signal)
            .await?;
        Ok(())
    }

    async fn relay_group(
        &self,
        ctx: &ConnectionContext,
        kind: GroupSignalKind,
        signal: plaza_types::api::v1::GroupCallSignal,
    ) -> Result<(), HandlerError> {
        let session = self.get_session(ctx.session_id).await?;
        let Some(poi_id) = session.current_poi.clone() else {
            return Err(HandlerError::Validation(
                "group signaling requires being inside a POI".to_owned(),
            ));
        };
        self.inner
            .relay
            .relay_group(&session, &poi_id, kind, signal)
            .await?;
        Ok(())
    }

    /// Presence read with a single retry on infrastructure failure.
    async fn get_session(&self, session_id: SessionId) -> Result<Session, HandlerError> {
        match self.inner.presence.get(session_id).await {
            Ok(session) => Ok(session),
            Err(PresenceError::NotFound(_)) => Err(HandlerError::SessionNotFound(session_id)),
            Err(PresenceError::Store(err)) => {
                tracing::warn!("presence read failed, retrying once: {err:?}");
                Ok(self.inner.presence.get(session_id).await?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::event_bus::{EventBus as _, MemoryEventBus, Subscription};
    use crate::services::hub::{ConnectionHub, HubArgs};
    use crate::services::poi_registry::{MemoryPoiRegistry, PoiRegistry as _};
    use crate::services::presence::{MemoryPresenceStore, PresenceStore as _};
    use crate::services::rate_limiter::{MemoryRateLimiter, Quota, RateLimitTable};
    use plaza_types::api::v1::Envelope;
    use plaza_types::{MapId, Position, UserId};
    use tokio_util::sync::CancellationToken;

    const TTL: Duration = Duration::from_secs(60);

    struct Fixture {
        router: MessageRouter,
        presence: PresenceService,
        registry: PoiRegistryService,
        bus: EventBusService,
    }

    fn fixture() -> Fixture {
        let mut table = RateLimitTable::default();
        table.insert(
            RateAction::UpdateAvatar,
            Quota {
                limit: 3,
                window: Duration::from_secs(60),
            },
        );
        table.insert(
            RateAction::JoinPoi,
            Quota {
                limit: 20,
                window: Duration::from_secs(60),
            },
        );
        let bus: EventBusService = Arc::new(MemoryEventBus::new());
        let registry: PoiRegistryService = Arc::new(MemoryPoiRegistry::new());
        let presence: PresenceService = Arc::new(MemoryPresenceStore::new());
        let rate_limiter: RateLimiterService = Arc::new(MemoryRateLimiter::new(table));
        let hub = ConnectionHub::new(HubArgs {
            bus: Arc::clone(&bus),
            registry: Arc::clone(&registry),
            outbound_queue_capacity: 32,
            cancellation_token: CancellationToken::new(),
        });
        let relay = SignalingRelay::new(
            hub.clone(),
            Arc::clone(&presence),
            Arc::clone(&registry),
            Arc::clone(&bus),
        );
        let router = MessageRouter::new(RouterArgs {
            presence: Arc::clone(&presence),
            registry: Arc::clone(&registry),
            rate_limiter,
            bus: Arc::clone(&bus),
            relay,
            session_ttl: TTL,
        });
        Fixture {
            router,
            presence,
            registry,
            bus,
        }
    }

    async fn live_session(fixture: &Fixture, user: &str) -> (Session, ConnectionContext) {
        let session = Session::new(
            UserId::from(user),
            MapId::from("m1"),
            Position { lat: 0.0, lng: 0.0 },
        );
        fixture.presence.put(session.clone(), TTL).await.unwrap();
        let ctx = ConnectionContext::from_session(&session);
        (session, ctx)
    }

    async fn next(channel: &mut Subscription) -> BusEnvelope {
        tokio::time::timeout(Duration::from_secs(1), channel.next())
            .await
            .expect("bus event within a second")
            .expect("channel open")
    }

    fn join(poi: &str, max: u32) -> ClientFrame {
        ClientFrame::PoiJoined(PoiJoinRequest {
            poi_id: PoiId::from(poi),
            max_participants: max,
        })
    }

    #[tokio::test]
    async fn avatar_move_validates_ranges() {
        let fixture = fixture();
        let (_, ctx) = live_session(&fixture, "ada").await;
        // exact bounds pass
        fixture
            .router
            .handle_frame(
                &ctx,
                ClientFrame::AvatarMove(AvatarMove {
                    position: Position { lat: 90.0, lng: -180.0 },
                }),
            )
            .await
            .unwrap();
        // just outside is rejected without mutating state
        let err = fixture
            .router
            .handle_frame(
                &ctx,
                ClientFrame::AvatarMove(AvatarMove {
                    position: Position {
                        lat: 90.000001,
                        lng: 0.0,
                    },
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Validation(_)));
        let session = fixture.presence.get(ctx.session_id).await.unwrap();
        assert_eq!(session.position, Position { lat: 90.0, lng: -180.0 });
    }

    #[tokio::test]
    async fn avatar_move_publishes_without_echo() {
        let fixture = fixture();
        let (_, ctx) = live_session(&fixture, "ada").await;
        let mut channel = fixture.bus.subscribe(&ctx.map_id).await.unwrap();
        fixture
            .router
            .handle_frame(
                &ctx,
                ClientFrame::AvatarMove(AvatarMove {
                    position: Position {
                        lat: 40.7128,
                        lng: -74.006,
                    },
                }),
            )
            .await
            .unwrap();
        let envelope = next(&mut channel).await;
        assert_eq!(envelope.exclude_session, Some(ctx.session_id));
        let ServerEvent::AvatarMoved(moved) = envelope.event.event else {
            panic!("expected avatar_moved");
        };
        assert_eq!(moved.session_id, ctx.session_id);
        assert_eq!(moved.position.lat, 40.7128);
    }

    #[tokio::test]
    async fn avatar_move_rate_limit_blocks_the_publish() {
        let fixture = fixture();
        let (_, ctx) = live_session(&fixture, "ada").await;
        let mut channel = fixture.bus.subscribe(&ctx.map_id).await.unwrap();
        let frame = ClientFrame::AvatarMove(AvatarMove {
            position: Position { lat: 1.0, lng: 1.0 },
        });
        for _ in 0..3 {
            fixture.router.handle_frame(&ctx, frame.clone()).await.unwrap();
        }
        let err = fixture
            .router
            .handle_frame(&ctx, frame.clone())
            .await
            .unwrap_err();
        let error_frame = err.error_frame();
        assert_eq!(error_frame.code, error_codes::RATE_LIMIT_EXCEEDED);
        assert!(error_frame.retry_after.unwrap() > 0);
        // exactly the three allowed moves reached the bus
        for _ in 0..3 {
            let envelope = next(&mut channel).await;
            assert!(matches!(envelope.event.event, ServerEvent::AvatarMoved(_)));
        }
        fixture
            .bus
            .publish(
                &ctx.map_id,
                BusEnvelope::broadcast(ServerEvent::Error(ErrorFrame::new("marker", "marker"))),
            )
            .await;
        assert!(matches!(
            next(&mut channel).await.event.event,
            ServerEvent::Error(_)
        ));
    }

    #[tokio::test]
    async fn poi_join_updates_session_and_publishes() {
        let fixture = fixture();
        let (_, ctx) = live_session(&fixture, "ada").await;
        let mut channel = fixture.bus.subscribe(&ctx.map_id).await.unwrap();
        fixture.router.handle_frame(&ctx, join("cafe", 4)).await.unwrap();

        let envelope = next(&mut channel).await;
        let ServerEvent::PoiJoined(change) = envelope.event.event else {
            panic!("expected poi_joined");
        };
        assert_eq!(change.current_count, 1);
        assert_eq!(
            fixture.presence.get(ctx.session_id).await.unwrap().current_poi,
            Some(PoiId::from("cafe"))
        );

        // joining the POI we are already in is a no-op
        fixture.router.handle_frame(&ctx, join("cafe", 4)).await.unwrap();
        fixture
            .bus
            .publish(
                &ctx.map_id,
                BusEnvelope::broadcast(ServerEvent::Error(ErrorFrame::new("marker", "marker"))),
            )
            .await;
        assert!(matches!(
            next(&mut channel).await.event.event,
            ServerEvent::Error(_)
        ));
    }

    #[tokio::test]
    async fn switching_pois_emits_left_then_joined() {
        let fixture = fixture();
        let (_, ctx) = live_session(&fixture, "ada").await;
        fixture.router.handle_frame(&ctx, join("p", 4)).await.unwrap();
        let mut channel = fixture.bus.subscribe(&ctx.map_id).await.unwrap();

        fixture.router.handle_frame(&ctx, join("q", 4)).await.unwrap();

        let first = next(&mut channel).await;
        let ServerEvent::PoiLeft(left) = first.event.event else {
            panic!("expected poi_left first");
        };
        assert_eq!(left.poi_id, PoiId::from("p"));
        assert_eq!(left.current_count, 0);
        let second = next(&mut channel).await;
        let ServerEvent::PoiJoined(joined) = second.event.event else {
            panic!("expected poi_joined second");
        };
        assert_eq!(joined.poi_id, PoiId::from("q"));
        assert_eq!(joined.current_count, 1);

        assert!(!fixture
            .registry
            .is_member(&PoiId::from("p"), ctx.session_id)
            .await
            .unwrap());
        assert!(fixture
            .registry
            .is_member(&PoiId::from("q"), ctx.session_id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn capacity_failure_keeps_the_old_membership() {
        let fixture = fixture();
        let (_, ada) = live_session(&fixture, "ada").await;
        let (_, grace) = live_session(&fixture, "grace").await;
        fixture.router.handle_frame(&grace, join("full", 1)).await.unwrap();
        fixture.router.handle_frame(&ada, join("p", 4)).await.unwrap();

        let err = fixture
            .router
            .handle_frame(&ada, join("full", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::PoiCapacity { .. }));
        assert_eq!(err.error_frame().code, error_codes::POI_CAPACITY);

        let session = fixture.presence.get(ada.session_id).await.unwrap();
        assert_eq!(session.current_poi, Some(PoiId::from("p")));
        assert!(fixture
            .registry
            .is_member(&PoiId::from("p"), ada.session_id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn join_on_deleted_poi_reports_not_found() {
        let fixture = fixture();
        let (_, ctx) = live_session(&fixture, "ada").await;
        fixture.registry.clear(&PoiId::from("gone")).await.unwrap();
        let err = fixture
            .router
            .handle_frame(&ctx, join("gone", 4))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::PoiNotFound(_)));
    }

    #[tokio::test]
    async fn poi_leave_is_idempotent() {
        let fixture = fixture();
        let (_, ctx) = live_session(&fixture, "ada").await;
        fixture.router.handle_frame(&ctx, join("cafe", 4)).await.unwrap();
        fixture.router.handle_frame(&ctx, ClientFrame::PoiLeft).await.unwrap();
        assert_eq!(
            fixture.presence.get(ctx.session_id).await.unwrap().current_poi,
            None
        );
        // leaving while IDLE changes nothing and is not an error
        fixture.router.handle_frame(&ctx, ClientFrame::PoiLeft).await.unwrap();
        assert_eq!(
            fixture.registry.count(&PoiId::from("cafe")).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn heartbeat_touches_the_session() {
        let fixture = fixture();
        let session = Session::new(
            UserId::from("ada"),
            MapId::from("m1"),
            Position { lat: 0.0, lng: 0.0 },
        );
        fixture
            .presence
            .put(session.clone(), Duration::from_millis(40))
            .await
            .unwrap();
        let ctx = ConnectionContext::from_session(&session);
        tokio::time::sleep(Duration::from_millis(25)).await;
        fixture
            .router
            .handle_frame(&ctx, ClientFrame::Heartbeat)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        // without the heartbeat the 40ms TTL would have expired by now
        assert!(fixture.presence.get(ctx.session_id).await.is_ok());
    }

    #[tokio::test]
    async fn heartbeat_for_vanished_session_reports_not_found() {
        let fixture = fixture();
        let (session, ctx) = live_session(&fixture, "ada").await;
        fixture.presence.remove(session.id).await.unwrap();
        let err = fixture
            .router
            .handle_frame(&ctx, ClientFrame::Heartbeat)
            .await
            .unwrap_err();
        assert_eq!(err.error_frame().code, error_codes::SESSION_NOT_FOUND);
    }

    #[tokio::test]
    async fn group_signal_outside_poi_is_invalid() {
        let fixture = fixture();
        let (_, ctx) = live_session(&fixture, "ada").await;
        let err = fixture
            .router
            .handle_frame(
                &ctx,
                ClientFrame::GroupCallIce(plaza_types::api::v1::GroupCallSignal {
                    call_id: plaza_types::CallId::from("g1"),
                    peer_id: UserId::from("bob"),
                    from_user_id: None,
                    payload: serde_json::Value::Null,
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_frame().code, error_codes::INVALID_REQUEST);
    }
}
