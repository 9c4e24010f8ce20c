//! WebRTC signaling relay.
//!
//! The relay is stateless beyond live connection membership: it stamps the
//! sender identity onto each frame (so peers cannot impersonate each other),
//! validates that group frames stay inside one POI, and forwards the SDP/ICE
//! payloads verbatim. Nothing is buffered: a frame towards a peer without a
//! live session is dropped and the sender told the call is unreachable.
//!
//! The group call itself is implicit in the POI: when the second participant
//! joins, every current member receives `group_call_started` with its peer
//! set; later joiners announce themselves via `group_call_peer_joined`. For
//! every peer pair, the side with the lexically greater user id initiates
//! the offer; that contract lives in the payload types, the relay only
//! forwards.

use plaza_types::api::v1::{
    CallSignal, GroupCallPeer, GroupCallSignal, GroupCallStarted, ServerEvent,
};
use plaza_types::{MapId, PoiId, Session, SessionId, UserId};

use crate::metrics::{METRICS_ID_NODE_SIGNALS_RELAYED, METRICS_ID_NODE_SIGNALS_UNREACHABLE};
use crate::services::event_bus::{BusEnvelope, EventBus as _, EventBusService};
use crate::services::hub::ConnectionHub;
use crate::services::poi_registry::{PoiRegistry as _, PoiRegistryError, PoiRegistryService};
use crate::services::presence::{PresenceError, PresenceService, PresenceStore as _};

/// All errors a relay operation may produce.
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    /// The target has no live session on the sender's map.
    #[error("user {0} has no live session on this map")]
    Unreachable(UserId),
    /// The target does not share the sender's POI.
    #[error("user {0} does not share a POI with the sender")]
    NotCoLocated(UserId),
    /// Registry lookup failed.
    #[error(transparent)]
    Registry(#[from] PoiRegistryError),
    /// Presence lookup failed.
    #[error(transparent)]
    Presence(#[from] PresenceError),
}

/// The 1-1 frame kinds the relay forwards.
#[derive(Clone, Copy, Debug)]
pub enum DirectSignalKind {
    /// Call invitation.
    Request,
    /// Invitation accepted.
    Accept,
    /// Invitation rejected.
    Reject,
    /// Hang-up.
    End,
    /// SDP offer.
    Offer,
    /// SDP answer.
    Answer,
    /// ICE candidate.
    Ice,
}

impl DirectSignalKind {
    fn into_event(self, signal: CallSignal) -> ServerEvent {
        match self {
            DirectSignalKind::Request => ServerEvent::CallRequest(signal),
            DirectSignalKind::Accept => ServerEvent::CallAccept(signal),
            DirectSignalKind::Reject => ServerEvent::CallReject(signal),
            DirectSignalKind::End => ServerEvent::CallEnd(signal),
            DirectSignalKind::Offer => ServerEvent::CallOffer(signal),
            DirectSignalKind::Answer => ServerEvent::CallAnswer(signal),
            DirectSignalKind::Ice => ServerEvent::CallIce(signal),
        }
    }
}

/// The group frame kinds the relay forwards.
#[derive(Clone, Copy, Debug)]
pub enum GroupSignalKind {
    /// SDP offer.
    Offer,
    /// SDP answer.
    Answer,
    /// ICE candidate.
    Ice,
}

impl GroupSignalKind {
    fn into_event(self, signal: GroupCallSignal) -> ServerEvent {
        match self {
            GroupSignalKind::Offer => ServerEvent::GroupCallOffer(signal),
            GroupSignalKind::Answer => ServerEvent::GroupCallAnswer(signal),
            GroupSignalKind::Ice => ServerEvent::GroupCallIce(signal),
        }
    }
}

/// Stateless forwarding of signaling frames between live peers.
#[derive(Clone)]
pub struct SignalingRelay {
    hub: ConnectionHub,
    presence: PresenceService,
    registry: PoiRegistryService,
    bus: EventBusService,
}

impl SignalingRelay {
    /// Builds the relay over the shared services.
    pub fn new(
        hub: ConnectionHub,
        presence: PresenceService,
        registry: PoiRegistryService,
        bus: EventBusService,
    ) -> Self {
        Self {
            hub,
            presence,
            registry,
            bus,
        }
    }

    /// Forwards a 1-1 signaling frame to the target user.
    ///
    /// Local connections are reached directly; a target live on the map but
    /// connected elsewhere is reached via its user channel. A target with
    /// no live session on the map is unreachable.
    pub async fn relay_direct(
        &self,
        from: &UserId,
        map_id: &MapId,
        kind: DirectSignalKind,
        mut signal: CallSignal,
    ) -> Result<(), SignalingError> {
        signal.from_user_id = Some(from.clone());
        let target = signal.to_user_id.clone();
        let event = kind.into_event(signal);

        if self.hub.send_to_user(&target, event.clone()) > 0 {
            ::metrics::counter!(METRICS_ID_NODE_SIGNALS_RELAYED).increment(1);
            return Ok(());
        }
        let on_map = self
            .presence
            .list_active(map_id)
            .await?
            .into_iter()
            .any(|session| session.user_id == target);
        if !on_map {
            ::metrics::counter!(METRICS_ID_NODE_SIGNALS_UNREACHABLE).increment(1);
            return Err(SignalingError::Unreachable(target));
        }
        self.bus
            .publish_user(&target, BusEnvelope::broadcast(event))
            .await;
        ::metrics::counter!(METRICS_ID_NODE_SIGNALS_RELAYED).increment(1);
        Ok(())
    }

    /// Forwards a group-call frame to a peer inside the sender's POI.
    ///
    /// Validates that the sender occupies the POI and that the peer has at
    /// least one co-located session; delivery is targeted at exactly those
    /// sessions, on whichever node they live.
    pub async fn relay_group(
        &self,
        sender: &Session,
        poi_id: &PoiId,
        kind: GroupSignalKind,
        mut signal: GroupCallSignal,
    ) -> Result<(), SignalingError> {
        if !self.registry.is_member(poi_id, sender.id).await? {
            return Err(SignalingError::NotCoLocated(sender.user_id.clone()));
        }
        signal.from_user_id = Some(sender.user_id.clone());
        let peer = signal.peer_id.clone();

        let mut co_located = Vec::new();
        for session in self.presence.list_active(&sender.map_id).await? {
            if session.user_id == peer && self.registry.is_member(poi_id, session.id).await? {
                co_located.push(session.id);
            }
        }
        if co_located.is_empty() {
            ::metrics::counter!(METRICS_ID_NODE_SIGNALS_UNREACHABLE).increment(1);
            return Err(SignalingError::NotCoLocated(peer));
        }
        self.bus
            .publish(
                &sender.map_id,
                BusEnvelope::targeted(kind.into_event(signal), co_located),
            )
            .await;
        ::metrics::counter!(METRICS_ID_NODE_SIGNALS_RELAYED).increment(1);
        Ok(())
    }

    /// Group-call choreography after a successful join.
    ///
    /// `prior_members` is the participant set right before the join: with
    /// one prior member the call starts now and both sides receive
    /// `group_call_started`; with more, the existing members learn the
    /// newcomer via `group_call_peer_joined` while the newcomer still gets
    /// `group_call_started` with its full peer set.
    pub async fn announce_join(
        &self,
        joiner: &Session,
        poi_id: &PoiId,
        prior_members: &[SessionId],
    ) -> Result<(), SignalingError> {
        if prior_members.is_empty() {
            return Ok(());
        }
        let mut peers = Vec::new();
        for member in prior_members {
            match self.presence.get(*member).await {
                Ok(session) => peers.push(session.user_id),
                // a member that expired mid-join simply isn't a peer
                Err(PresenceError::NotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        if peers.is_empty() {
            return Ok(());
        }

        self.bus
            .publish(
                &joiner.map_id,
                BusEnvelope::targeted(
                    ServerEvent::GroupCallStarted(GroupCallStarted {
                        poi_id: poi_id.clone(),
                        peers,
                    }),
                    vec![joiner.id],
                ),
            )
            .await;

        let towards_existing = if prior_members.len() == 1 {
            ServerEvent::GroupCallStarted(GroupCallStarted {
                poi_id: poi_id.clone(),
                peers: vec![joiner.user_id.clone()],
            })
        } else {
            ServerEvent::GroupCallPeerJoined(GroupCallPeer {
                poi_id: poi_id.clone(),
                peer_id: joiner.user_id.clone(),
            })
        };
        self.bus
            .publish(
                &joiner.map_id,
                BusEnvelope::targeted(towards_existing, prior_members.to_vec()),
            )
            .await;
        Ok(())
    }

    /// Tells the remaining members of a POI that a peer left its call.
    pub async fn announce_leave(
        &self,
        map_id: &MapId,
        poi_id: &PoiId,
        leaver: &UserId,
    ) -> Result<(), SignalingError> {
        self.hub
            .broadcast_to_poi(
                map_id,
                poi_id,
                ServerEvent::GroupCallPeerLeft(GroupCallPeer {
                    poi_id: poi_id.clone(),
                    peer_id: leaver.clone(),
                }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::event_bus::{EventBus as _, MemoryEventBus};
    use crate::services::hub::{ConnectionHub, HubArgs};
    use crate::services::poi_registry::{MemoryPoiRegistry, PoiRegistry as _};
    use crate::services::presence::{MemoryPresenceStore, PresenceStore as _};
    use plaza_types::api::v1::Envelope;
    use plaza_types::{CallId, Position};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        relay: SignalingRelay,
        hub: ConnectionHub,
        presence: PresenceService,
        registry: PoiRegistryService,
        bus: EventBusService,
    }

    fn fixture() -> Fixture {
        let bus: EventBusService = Arc::new(MemoryEventBus::new());
        let registry: PoiRegistryService = Arc::new(MemoryPoiRegistry::new());
        let presence: PresenceService = Arc::new(MemoryPresenceStore::new());
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
        Fixture {
            relay,
            hub,
            presence,
            registry,
            bus,
        }
    }

    fn session(user: &str) -> Session {
        Session::new(
            UserId::from(user),
            MapId::from("m1"),
            Position { lat: 0.0, lng: 0.0 },
        )
    }

    async fn recv(
        rx: &mut tokio::sync::mpsc::Receiver<crate::services::hub::OutboundFrame>,
    ) -> ServerEvent {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame within a second")
            .expect("queue open");
        serde_json::from_str::<Envelope>(&frame).unwrap().event
    }

    #[tokio::test]
    async fn direct_relay_stamps_the_sender() {
        let fixture = fixture();
        let ada = session("ada");
        let bob = session("bob");
        let mut bob_reg = fixture.hub.register(&bob).unwrap();
        recv(&mut bob_reg.outbound).await;

        fixture
            .relay
            .relay_direct(
                &ada.user_id,
                &ada.map_id,
                DirectSignalKind::Offer,
                CallSignal {
                    call_id: CallId::from("c1"),
                    to_user_id: bob.user_id.clone(),
                    from_user_id: Some(UserId::from("mallory")),
                    payload: serde_json::json!({"sdp": "v=0"}),
                },
            )
            .await
            .unwrap();

        let ServerEvent::CallOffer(signal) = recv(&mut bob_reg.outbound).await else {
            panic!("expected call_offer");
        };
        assert_eq!(signal.from_user_id, Some(ada.user_id));
        assert_eq!(signal.payload["sdp"], "v=0");
    }

    #[tokio::test]
    async fn direct_relay_to_absent_user_is_unreachable() {
        let fixture = fixture();
        let ada = session("ada");
        let err = fixture
            .relay
            .relay_direct(
                &ada.user_id,
                &ada.map_id,
                DirectSignalKind::Request,
                CallSignal {
                    call_id: CallId::from("c1"),
                    to_user_id: UserId::from("nobody"),
                    from_user_id: None,
                    payload: serde_json::Value::Null,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::Unreachable(_)));
    }

    #[tokio::test]
    async fn direct_relay_uses_the_user_channel_for_remote_targets() {
        let fixture = fixture();
        let ada = session("ada");
        let bob = session("bob");
        // bob is live on the map but not connected to this node
        fixture
            .presence
            .put(bob.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        let mut channel = fixture.bus.subscribe_user(&bob.user_id).await.unwrap();

        fixture
            .relay
            .relay_direct(
                &ada.user_id,
                &ada.map_id,
                DirectSignalKind::End,
                CallSignal {
                    call_id: CallId::from("c1"),
                    to_user_id: bob.user_id.clone(),
                    from_user_id: None,
                    payload: serde_json::Value::Null,
                },
            )
            .await
            .unwrap();
        let envelope = tokio::time::timeout(Duration::from_secs(1), channel.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(envelope.event.event, ServerEvent::CallEnd(_)));
    }

    #[tokio::test]
    async fn group_relay_requires_co_location() {
        let fixture = fixture();
        let poi = PoiId::from("cafe");
        let ada = session("ada");
        let bob = session("bob");
        fixture
            .presence
            .put(ada.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        fixture
            .presence
            .put(bob.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        fixture.registry.join(&poi, ada.id, 4).await.unwrap();
        // bob is on the map but NOT in the poi
        let signal = GroupCallSignal {
            call_id: CallId::from("g1"),
            peer_id: bob.user_id.clone(),
            from_user_id: None,
            payload: serde_json::Value::Null,
        };
        let err = fixture
            .relay
            .relay_group(&ada, &poi, GroupSignalKind::Offer, signal.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::NotCoLocated(_)));

        // once bob joins, the same frame goes through, targeted at bob only
        fixture.registry.join(&poi, bob.id, 4).await.unwrap();
        let mut map_channel = fixture.bus.subscribe(&ada.map_id).await.unwrap();
        fixture
            .relay
            .relay_group(&ada, &poi, GroupSignalKind::Offer, signal)
            .await
            .unwrap();
        let envelope = tokio::time::timeout(Duration::from_secs(1), map_channel.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.only_sessions, Some(vec![bob.id]));
        let ServerEvent::GroupCallOffer(out) = envelope.event.event else {
            panic!("expected group_call_offer");
        };
        assert_eq!(out.from_user_id, Some(ada.user_id));
    }

    #[tokio::test]
    async fn second_join_starts_the_call_for_both_sides() {
        let fixture = fixture();
        let poi = PoiId::from("cafe");
        let ada = session("ada");
        let bob = session("bob");
        for session in [&ada, &bob] {
            fixture
                .presence
                .put(session.clone(), Duration::from_secs(60))
                .await
                .unwrap();
        }
        fixture.registry.join(&poi, ada.id, 4).await.unwrap();
        let mut map_channel = fixture.bus.subscribe(&ada.map_id).await.unwrap();

        fixture
            .relay
            .announce_join(&bob, &poi, &[ada.id])
            .await
            .unwrap();

        let towards_bob = tokio::time::timeout(Duration::from_secs(1), map_channel.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(towards_bob.only_sessions, Some(vec![bob.id]));
        let ServerEvent::GroupCallStarted(started) = towards_bob.event.event else {
            panic!("expected group_call_started");
        };
        assert_eq!(started.peers, vec![ada.user_id]);

        let towards_ada = tokio::time::timeout(Duration::from_secs(1), map_channel.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(towards_ada.only_sessions, Some(vec![ada.id]));
        assert!(matches!(
            towards_ada.event.event,
            ServerEvent::GroupCallStarted(_)
        ));
    }

    #[tokio::test]
    async fn third_join_announces_a_peer() {
        let fixture = fixture();
        let poi = PoiId::from("cafe");
        let ada = session("ada");
        let bob = session("bob");
        let eve = session("eve");
        for session in [&ada, &bob, &eve] {
            fixture
                .presence
                .put((*session).clone(), Duration::from_secs(60))
                .await
                .unwrap();
        }
        fixture.registry.join(&poi, ada.id, 4).await.unwrap();
        fixture.registry.join(&poi, bob.id, 4).await.unwrap();
        let mut map_channel = fixture.bus.subscribe(&ada.map_id).await.unwrap();

        fixture
            .relay
            .announce_join(&eve, &poi, &[ada.id, bob.id])
            .await
            .unwrap();

        let towards_eve = tokio::time::timeout(Duration::from_secs(1), map_channel.next())
            .await
            .unwrap()
            .unwrap();
        let ServerEvent::GroupCallStarted(started) = towards_eve.event.event else {
            panic!("expected group_call_started for the newcomer");
        };
        assert_eq!(started.peers.len(), 2);

        let towards_existing = tokio::time::timeout(Duration::from_secs(1), map_channel.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            towards_existing.only_sessions,
            Some(vec![ada.id, bob.id])
        );
        let ServerEvent::GroupCallPeerJoined(joined) = towards_existing.event.event else {
            panic!("expected group_call_peer_joined");
        };
        assert_eq!(joined.peer_id, eve.user_id);
    }
}
