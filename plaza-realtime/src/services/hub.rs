//! Connection hub: socket ownership, per-connection queues, map fan-out.
//!
//! The hub owns every live connection. A connection is registered in
//! exactly one map directory entry for its lifetime, carries a bounded
//! outbound queue drained by a single writer task, and is closed under the
//! stalled-peer policy when that queue overflows: frame loss on a shared
//! map produces UI drift that never heals, whereas a closed client
//! reconnects and resyncs from authoritative state.
//!
//! For every map (and user) with at least one local connection, the hub
//! runs one feed task subscribed to the corresponding bus channel and
//! mirrors its events into local fan-out. All map-wide events travel via
//! the bus, so one node and many nodes share the same delivery path. A feed
//! whose subscription ends is resubscribed; the feed stops when the last
//! interested connection leaves.
//!
//! Lock discipline: directories are behind read/write locks; fan-out
//! snapshots the target set under shared access and enqueues only after
//! releasing the lock, so one stalled writer can never block broadcasters.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use plaza_types::api::v1::{Envelope, GroupCallPeer, PoiMembershipChange, ServerEvent, Welcome};
use plaza_types::{MapId, PoiId, Session, SessionId, Timestamp, UserId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::metrics::{
    METRICS_ID_NODE_CONNECTIONS_OPEN, METRICS_ID_NODE_CONNECTIONS_STALLED,
    METRICS_ID_NODE_FANOUT_SIZE,
};
use crate::services::event_bus::{self, BusEnvelope, EventBus as _, EventBusService};
use crate::services::poi_registry::{PoiRegistry as _, PoiRegistryService};

/// A serialized outbound frame, shared across the queues of one fan-out.
pub type OutboundFrame = Arc<str>;

/// Identity of one registered connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// All errors the hub may report to the websocket layer.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The hub no longer accepts connections.
    #[error("hub is shutting down")]
    ShuttingDown,
}

/// What the websocket layer receives for a freshly registered connection.
pub struct Registration {
    /// The connection identity, needed for unregistration.
    pub conn_id: ConnectionId,
    /// The outbound queue the writer task drains.
    pub outbound: mpsc::Receiver<OutboundFrame>,
    /// Cancelled when the hub closes the connection (stalled peer,
    /// superseded session, shutdown).
    pub cancel: CancellationToken,
}

#[derive(Clone)]
struct ConnectionHandle {
    session_id: SessionId,
    user_id: UserId,
    map_id: MapId,
    outbound: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
}

struct Feed {
    refs: usize,
    cancel: CancellationToken,
}

#[derive(Clone)]
enum FeedKind {
    Map(MapId),
    User(UserId),
}

impl FeedKind {
    fn channel(&self) -> String {
        match self {
            FeedKind::Map(map_id) => event_bus::map_channel(map_id),
            FeedKind::User(user_id) => event_bus::user_channel(user_id),
        }
    }
}

/// Arguments to construct the [`ConnectionHub`].
pub struct HubArgs {
    /// The cross-node event bus the hub mirrors into local fan-out.
    pub bus: EventBusService,
    /// The POI registry consulted on unregister and POI-targeted fan-out.
    pub registry: PoiRegistryService,
    /// Capacity of each per-connection outbound queue.
    pub outbound_queue_capacity: usize,
    /// Parent token; cancelling it closes every connection.
    pub cancellation_token: CancellationToken,
}

/// Owner of all live connections and their fan-out directories.
#[derive(Clone)]
pub struct ConnectionHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    bus: EventBusService,
    registry: PoiRegistryService,
    outbound_capacity: usize,
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    by_map: RwLock<HashMap<MapId, HashSet<ConnectionId>>>,
    by_user: RwLock<HashMap<UserId, HashSet<ConnectionId>>>,
    by_session: RwLock<HashMap<SessionId, ConnectionId>>,
    feeds: Mutex<HashMap<String, Feed>>,
    next_id: AtomicU64,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    accepting: AtomicBool,
}

impl ConnectionHub {
    /// Creates a hub with empty directories.
    pub fn new(args: HubArgs) -> Self {
        Self {
            inner: Arc::new(HubInner {
                bus: args.bus,
                registry: args.registry,
                outbound_capacity: args.outbound_queue_capacity,
                connections: RwLock::new(HashMap::new()),
                by_map: RwLock::new(HashMap::new()),
                by_user: RwLock::new(HashMap::new()),
                by_session: RwLock::new(HashMap::new()),
                feeds: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                tracker: TaskTracker::new(),
                shutdown: args.cancellation_token,
                accepting: AtomicBool::new(true),
            }),
        }
    }

    /// Registers a connection for the session and starts its bus feeds.
    ///
    /// The `welcome` event is the first frame in the outbound queue. A
    /// previous connection of the same session is superseded and closed.
    pub fn register(&self, session: &Session) -> Result<Registration, HubError> {
        let inner = &self.inner;
        if !inner.accepting.load(Ordering::Relaxed) || inner.shutdown.is_cancelled() {
            return Err(HubError::ShuttingDown);
        }

        // a reconnect supersedes the previous socket of the session
        let superseded = inner
            .by_session
            .read()
            .get(&session.id)
            .copied()
            .and_then(|old| inner.connections.read().get(&old).cloned());
        if let Some(old) = superseded {
            tracing::debug!("superseding previous connection of session {}", session.id);
            old.cancel.cancel();
        }

        let conn_id = ConnectionId(inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(inner.outbound_capacity);
        let cancel = inner.shutdown.child_token();
        let handle = ConnectionHandle {
            session_id: session.id,
            user_id: session.user_id.clone(),
            map_id: session.map_id.clone(),
            outbound: tx,
            cancel: cancel.clone(),
        };

        // enqueue the welcome before the connection becomes visible to
        // fan-out, so it is always the first frame on the wire
        let welcome = Envelope::now(ServerEvent::Welcome(Welcome {
            session_id: session.id,
            user_id: session.user_id.clone(),
            map_id: session.map_id.clone(),
            server_time: Timestamp::now(),
        }));
        let _ = handle.outbound.try_send(encode(&welcome));

        inner.connections.write().insert(conn_id, handle);
        inner
            .by_map
            .write()
            .entry(session.map_id.clone())
            .or_default()
            .insert(conn_id);
        inner
            .by_user
            .write()
            .entry(session.user_id.clone())
            .or_default()
            .insert(conn_id);
        inner.by_session.write().insert(session.id, conn_id);

        inner.ensure_feed(FeedKind::Map(session.map_id.clone()));
        inner.ensure_feed(FeedKind::User(session.user_id.clone()));

        ::metrics::gauge!(METRICS_ID_NODE_CONNECTIONS_OPEN).increment(1);
        tracing::debug!(
            "registered {conn_id} for session {} on map {}",
            session.id,
            session.map_id
        );
        Ok(Registration {
            conn_id,
            outbound: rx,
            cancel,
        })
    }

    /// Removes the connection from every directory, then performs the
    /// departure bookkeeping: POI memberships are dissolved and the map is
    /// told via `poi_left` (and `group_call_peer_left` towards remaining
    /// POI members).
    ///
    /// Idempotent; the second call for a connection id is a no-op.
    pub async fn unregister(&self, conn_id: ConnectionId) {
        let inner = &self.inner;
        let Some(handle) = inner.connections.write().remove(&conn_id) else {
            return;
        };
        {
            let mut by_map = inner.by_map.write();
            if let Some(conns) = by_map.get_mut(&handle.map_id) {
                conns.remove(&conn_id);
                if conns.is_empty() {
                    by_map.remove(&handle.map_id);
                }
            }
        }
        {
            let mut by_user = inner.by_user.write();
            if let Some(conns) = by_user.get_mut(&handle.user_id) {
                conns.remove(&conn_id);
                if conns.is_empty() {
                    by_user.remove(&handle.user_id);
                }
            }
        }
        {
            let mut by_session = inner.by_session.write();
            if by_session.get(&handle.session_id) == Some(&conn_id) {
                by_session.remove(&handle.session_id);
            }
        }
        handle.cancel.cancel();
        inner.release_feed(&event_bus::map_channel(&handle.map_id));
        inner.release_feed(&event_bus::user_channel(&handle.user_id));
        ::metrics::gauge!(METRICS_ID_NODE_CONNECTIONS_OPEN).decrement(1);

        match inner.registry.remove_from_all(handle.session_id).await {
            Ok(affected) => {
                for (poi_id, count) in affected {
                    self.announce_departure(&handle, &poi_id, count).await;
                }
            }
            Err(err) => {
                tracing::error!(
                    "could not dissolve POI memberships of session {}: {err:?}",
                    handle.session_id
                );
            }
        }
        tracing::debug!("unregistered {conn_id} of session {}", handle.session_id);
    }

    async fn announce_departure(&self, handle: &ConnectionHandle, poi_id: &PoiId, count: u32) {
        self.inner
            .bus
            .publish(
                &handle.map_id,
                BusEnvelope::broadcast(ServerEvent::PoiLeft(PoiMembershipChange {
                    poi_id: poi_id.clone(),
                    session_id: handle.session_id,
                    user_id: handle.user_id.clone(),
                    current_count: count,
                })),
            )
            .await;
        if count > 0
            && let Err(err) = self
                .broadcast_to_poi(
                    &handle.map_id,
                    poi_id,
                    ServerEvent::GroupCallPeerLeft(GroupCallPeer {
                        poi_id: poi_id.clone(),
                        peer_id: handle.user_id.clone(),
                    }),
                )
                .await
        {
            tracing::warn!("could not notify remaining members of {poi_id}: {err:?}");
        }
    }

    /// Publishes a map-wide event on the bus; every node's feed (including
    /// this one) mirrors it to its local subscribers.
    pub async fn publish_map(&self, map_id: &MapId, envelope: BusEnvelope) {
        self.inner.bus.publish(map_id, envelope).await;
    }

    /// Publishes towards all current members of a POI, on whichever node
    /// they are connected.
    pub async fn broadcast_to_poi(
        &self,
        map_id: &MapId,
        poi_id: &PoiId,
        event: ServerEvent,
    ) -> Result<(), crate::services::poi_registry::PoiRegistryError> {
        let members = self.inner.registry.members(poi_id).await?;
        if members.is_empty() {
            return Ok(());
        }
        self.inner
            .bus
            .publish(map_id, BusEnvelope::targeted(event, members))
            .await;
        Ok(())
    }

    /// Enqueues an event to every local connection of the user.
    ///
    /// Returns the number of connections reached; `0` tells the caller the
    /// user is not connected to this node.
    pub fn send_to_user(&self, user_id: &UserId, event: ServerEvent) -> usize {
        let inner = &self.inner;
        let targets: Vec<ConnectionHandle> = {
            let by_user = inner.by_user.read();
            let connections = inner.connections.read();
            by_user
                .get(user_id)
                .into_iter()
                .flatten()
                .filter_map(|id| connections.get(id).cloned())
                .collect()
        };
        if targets.is_empty() {
            return 0;
        }
        let frame = encode(&Envelope::now(event));
        for handle in &targets {
            inner.try_enqueue(handle, frame.clone());
        }
        targets.len()
    }

    /// Enqueues an event to the connection of one session, if local.
    pub fn send_to_session(&self, session_id: SessionId, event: ServerEvent) -> bool {
        let inner = &self.inner;
        let handle = {
            let by_session = inner.by_session.read();
            let connections = inner.connections.read();
            by_session
                .get(&session_id)
                .and_then(|id| connections.get(id).cloned())
        };
        match handle {
            Some(handle) => {
                inner.try_enqueue(&handle, encode(&Envelope::now(event)));
                true
            }
            None => false,
        }
    }

    /// Number of currently registered connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    /// Spawns a connection-scoped task on the hub's tracker so shutdown can
    /// await it.
    pub fn track<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.tracker.spawn(fut)
    }

    /// Stops accepting registrations, closes every connection and waits at
    /// most `drain` for writers to flush their queues.
    pub async fn shutdown(&self, drain: Duration) {
        let inner = &self.inner;
        inner.accepting.store(false, Ordering::Relaxed);
        inner.shutdown.cancel();
        inner.tracker.close();
        if tokio::time::timeout(drain, inner.tracker.wait()).await.is_err() {
            tracing::warn!("connection drain did not finish within {drain:?}");
        }
    }
}

impl HubInner {
    /// Starts (or references) the feed task mirroring one bus channel.
    fn ensure_feed(self: &Arc<Self>, kind: FeedKind) {
        let channel = kind.channel();
        let mut feeds = self.feeds.lock();
        if let Some(feed) = feeds.get_mut(&channel) {
            feed.refs += 1;
            return;
        }
        let cancel = self.shutdown.child_token();
        let task_cancel = cancel.clone();
        let inner = Arc::clone(self);
        self.tracker.spawn(feed_task(inner, kind, task_cancel));
        feeds.insert(channel, Feed { refs: 1, cancel });
    }

    /// Drops one reference to a feed, stopping it when unused.
    fn release_feed(&self, channel: &str) {
        let mut feeds = self.feeds.lock();
        if let Some(feed) = feeds.get_mut(channel) {
            feed.refs -= 1;
            if feed.refs == 0 {
                feed.cancel.cancel();
                feeds.remove(channel);
            }
        }
    }

    /// Local fan-out of one bus envelope to the subscribers of a map.
    fn deliver_map(&self, map_id: &MapId, envelope: &BusEnvelope) {
        let targets: Vec<ConnectionHandle> = {
            let by_map = self.by_map.read();
            let connections = self.connections.read();
            by_map
                .get(map_id)
                .into_iter()
                .flatten()
                .filter_map(|id| connections.get(id).cloned())
                .filter(|handle| envelope.concerns(handle.session_id))
                .collect()
        };
        if targets.is_empty() {
            return;
        }
        ::metrics::histogram!(METRICS_ID_NODE_FANOUT_SIZE).record(targets.len() as f64);
        let frame = encode(&envelope.event);
        for handle in &targets {
            self.try_enqueue(handle, frame.clone());
        }
    }

    /// Local delivery of one user-channel envelope.
    fn deliver_user(&self, user_id: &UserId, envelope: &BusEnvelope) {
        let targets: Vec<ConnectionHandle> = {
            let by_user = self.by_user.read();
            let connections = self.connections.read();
            by_user
                .get(user_id)
                .into_iter()
                .flatten()
                .filter_map(|id| connections.get(id).cloned())
                .filter(|handle| envelope.concerns(handle.session_id))
                .collect()
        };
        let frame = encode(&envelope.event);
        for handle in &targets {
            self.try_enqueue(handle, frame.clone());
        }
    }

    /// Non-blocking enqueue; a full queue triggers the stalled-peer policy.
    fn try_enqueue(&self, handle: &ConnectionHandle, frame: OutboundFrame) {
        match handle.outbound.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                ::metrics::counter!(METRICS_ID_NODE_CONNECTIONS_STALLED).increment(1);
                tracing::warn!(
                    "outbound queue of session {} overflowed, closing the connection",
                    handle.session_id
                );
                handle.cancel.cancel();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // writer already gone, unregister will catch up
            }
        }
    }
}

/// Mirrors one bus channel into local fan-out until cancelled, restarting
/// the subscription whenever its stream ends.
async fn feed_task(inner: Arc<HubInner>, kind: FeedKind, cancel: CancellationToken) {
    loop {
        let subscription = match &kind {
            FeedKind::Map(map_id) => inner.bus.subscribe(map_id).await,
            FeedKind::User(user_id) => inner.bus.subscribe_user(user_id).await,
        };
        let mut subscription = match subscription {
            Ok(subscription) => subscription,
            Err(err) => {
                tracing::warn!("bus subscription failed: {err:?}");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                }
            }
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                item = subscription.next() => match item {
                    Some(envelope) => match &kind {
                        FeedKind::Map(map_id) => inner.deliver_map(map_id, &envelope),
                        FeedKind::User(user_id) => inner.deliver_user(user_id, &envelope),
                    },
                    None => break,
                }
            }
        }
        if cancel.is_cancelled() {
            return;
        }
        tracing::debug!("bus feed ended, resubscribing");
    }
}

fn encode(envelope: &Envelope) -> OutboundFrame {
    serde_json::to_string(envelope)
        .expect("can serialize envelope")
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::event_bus::{EventBus as _, MemoryEventBus};
    use crate::services::poi_registry::{MemoryPoiRegistry, PoiRegistry as _};
    use plaza_types::Position;
    use plaza_types::api::v1::{AvatarMoved, ClientFrame};

    fn hub_with(bus: EventBusService, registry: PoiRegistryService) -> ConnectionHub {
        ConnectionHub::new(HubArgs {
            bus,
            registry,
            outbound_queue_capacity: 8,
            cancellation_token: CancellationToken::new(),
        })
    }

    fn session(user: &str, map: &str) -> Session {
        Session::new(
            UserId::from(user),
            MapId::from(map),
            Position { lat: 0.0, lng: 0.0 },
        )
    }

    async fn next_event(rx: &mut mpsc::Receiver<OutboundFrame>) -> ServerEvent {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame within a second")
            .expect("queue open");
        serde_json::from_str::<Envelope>(&frame).unwrap().event
    }

    #[tokio::test]
    async fn welcome_is_the_first_frame() {
        let bus: EventBusService = Arc::new(MemoryEventBus::new());
        let registry: PoiRegistryService = Arc::new(MemoryPoiRegistry::new());
        let hub = hub_with(bus, registry);
        let session = session("ada", "m1");
        let mut registration = hub.register(&session).unwrap();
        let ServerEvent::Welcome(welcome) = next_event(&mut registration.outbound).await else {
            panic!("expected welcome");
        };
        assert_eq!(welcome.session_id, session.id);
        assert_eq!(welcome.map_id, session.map_id);
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn map_fanout_excludes_the_originator() {
        let bus: EventBusService = Arc::new(MemoryEventBus::new());
        let registry: PoiRegistryService = Arc::new(MemoryPoiRegistry::new());
        let hub = hub_with(Arc::clone(&bus), registry);
        let ada = session("ada", "m1");
        let grace = session("grace", "m1");
        let mut ada_reg = hub.register(&ada).unwrap();
        let mut grace_reg = hub.register(&grace).unwrap();
        next_event(&mut ada_reg.outbound).await;
        next_event(&mut grace_reg.outbound).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let moved = ServerEvent::AvatarMoved(AvatarMoved {
            session_id: ada.id,
            user_id: ada.user_id.clone(),
            position: Position { lat: 1.0, lng: 2.0 },
        });
        hub.publish_map(&ada.map_id, BusEnvelope::excluding(moved, ada.id))
            .await;

        assert!(matches!(
            next_event(&mut grace_reg.outbound).await,
            ServerEvent::AvatarMoved(_)
        ));
        // the originator must not see an echo; a later marker event proves
        // nothing else arrived in between
        hub.publish_map(
            &ada.map_id,
            BusEnvelope::broadcast(ServerEvent::PoiDeleted(plaza_types::api::v1::PoiDeleted {
                poi_id: PoiId::from("marker"),
                evicted: vec![],
            })),
        )
        .await;
        assert!(matches!(
            next_event(&mut ada_reg.outbound).await,
            ServerEvent::PoiDeleted(_)
        ));
    }

    #[tokio::test]
    async fn overflowing_queue_closes_the_connection() {
        let bus: EventBusService = Arc::new(MemoryEventBus::new());
        let registry: PoiRegistryService = Arc::new(MemoryPoiRegistry::new());
        let hub = hub_with(Arc::clone(&bus), registry);
        let ada = session("ada", "m1");
        // never drained: the queue (capacity 8, one slot used by welcome)
        // overflows after a burst
        let registration = hub.register(&ada).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        for _ in 0..16 {
            hub.publish_map(
                &ada.map_id,
                BusEnvelope::broadcast(ServerEvent::PoiDeleted(
                    plaza_types::api::v1::PoiDeleted {
                        poi_id: PoiId::from("p"),
                        evicted: vec![],
                    },
                )),
            )
            .await;
        }
        tokio::time::timeout(Duration::from_secs(1), registration.cancel.cancelled())
            .await
            .expect("stalled connection gets cancelled");
    }

    #[tokio::test]
    async fn unregister_dissolves_poi_membership_and_notifies() {
        let bus: EventBusService = Arc::new(MemoryEventBus::new());
        let registry: PoiRegistryService = Arc::new(MemoryPoiRegistry::new());
        let hub = hub_with(Arc::clone(&bus), Arc::clone(&registry));
        let ada = session("ada", "m1");
        let poi = PoiId::from("cafe");
        registry.join(&poi, ada.id, 4).await.unwrap();

        let mut observer = bus.subscribe(&ada.map_id).await.unwrap();
        let registration = hub.register(&ada).unwrap();
        hub.unregister(registration.conn_id).await;

        assert_eq!(hub.connection_count(), 0);
        assert_eq!(registry.count(&poi).await.unwrap(), 0);
        let envelope = tokio::time::timeout(Duration::from_secs(1), observer.next())
            .await
            .unwrap()
            .unwrap();
        let ServerEvent::PoiLeft(change) = envelope.event.event else {
            panic!("expected poi_left");
        };
        assert_eq!(change.poi_id, poi);
        assert_eq!(change.session_id, ada.id);
        assert_eq!(change.current_count, 0);

        // double unregister is a no-op
        hub.unregister(registration.conn_id).await;
    }

    #[tokio::test]
    async fn send_to_user_reaches_only_local_connections() {
        let bus: EventBusService = Arc::new(MemoryEventBus::new());
        let registry: PoiRegistryService = Arc::new(MemoryPoiRegistry::new());
        let hub = hub_with(bus, registry);
        let ada = session("ada", "m1");
        let mut registration = hub.register(&ada).unwrap();
        next_event(&mut registration.outbound).await;

        assert_eq!(
            hub.send_to_user(
                &ada.user_id,
                ServerEvent::Error(plaza_types::api::v1::ErrorFrame::new("INTERNAL_ERROR", "x"))
            ),
            1
        );
        assert!(matches!(
            next_event(&mut registration.outbound).await,
            ServerEvent::Error(_)
        ));
        assert_eq!(
            hub.send_to_user(
                &UserId::from("ghost"),
                ServerEvent::Error(plaza_types::api::v1::ErrorFrame::new("INTERNAL_ERROR", "x"))
            ),
            0
        );
    }

    #[tokio::test]
    async fn shutdown_rejects_new_registrations() {
        let bus: EventBusService = Arc::new(MemoryEventBus::new());
        let registry: PoiRegistryService = Arc::new(MemoryPoiRegistry::new());
        let hub = hub_with(bus, registry);
        hub.shutdown(Duration::from_millis(100)).await;
        assert!(matches!(
            hub.register(&session("ada", "m1")),
            Err(HubError::ShuttingDown)
        ));
    }

    #[test]
    fn client_frame_is_not_accepted_as_server_event() {
        // the inbound and outbound sums are distinct types on purpose
        let json = serde_json::to_string(&ClientFrame::Heartbeat).unwrap();
        assert!(serde_json::from_str::<ServerEvent>(&json).is_err());
    }
}
