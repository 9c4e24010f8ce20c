//! Cross-node event bus.
//!
//! This module defines the [`EventBus`] trait: one pub/sub channel per map
//! (`map:{id}:events`) plus one per user for directed delivery
//! (`user:{id}:events`). Every map-wide event travels via the bus (local
//! fan-out is the degenerate single-node case), so one code path serves one
//! node or many.
//!
//! Publishes are at-most-once and fire-and-forget: storage errors are
//! logged, never retried. A slow subscriber loses events rather than ever
//! blocking publishers; the connection hub restarts subscriptions whose
//! stream ended.
//!
//! Current `EventBus` implementations:
//! - [`MemoryEventBus`] (process-local, single-node and tests)
//! - Redis pub/sub (cross-node, feature `redis`)

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use plaza_types::api::v1::{Envelope, ServerEvent};
use plaza_types::{MapId, SessionId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::metrics::{METRICS_ID_NODE_EVENTS_DROPPED, METRICS_ID_NODE_EVENTS_PUBLISHED};

#[cfg(feature = "redis")]
pub mod redis;

/// Dynamic trait object for the event bus service.
///
/// Must be `Send + Sync` to work with async contexts (e.g., Axum).
pub type EventBusService = Arc<dyn EventBus + Send + Sync>;

/// Events a publisher may buffer per channel before slow subscribers lag.
const CHANNEL_CAPACITY: usize = 256;
/// Frames buffered between a subscription and its consumer.
const SUBSCRIPTION_BUFFER: usize = 64;

/// All errors a bus operation may produce.
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    /// The backing transport failed.
    #[error("event bus error: {0}")]
    Transport(#[source] eyre::Error),
}

/// The unit travelling on a channel: the wire envelope plus the routing
/// metadata that must survive crossing nodes.
///
/// `exclude_session` is how "no echo to the originator" works when the
/// originator is connected to a different node than the subscriber doing
/// the fan-out; `only_sessions` narrows a map-channel event to the POI
/// members it concerns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BusEnvelope {
    /// The wire envelope delivered to matching connections.
    pub event: Envelope,
    /// Session that must not receive the event (its own action caused it).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_session: Option<SessionId>,
    /// When set, only these sessions receive the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_sessions: Option<Vec<SessionId>>,
}

impl BusEnvelope {
    /// An event for every subscriber of the channel.
    pub fn broadcast(event: ServerEvent) -> Self {
        Self {
            event: Envelope::now(event),
            exclude_session: None,
            only_sessions: None,
        }
    }

    /// An event for every subscriber except the originating session.
    pub fn excluding(event: ServerEvent, session_id: SessionId) -> Self {
        Self {
            event: Envelope::now(event),
            exclude_session: Some(session_id),
            only_sessions: None,
        }
    }

    /// An event for the listed sessions only.
    pub fn targeted(event: ServerEvent, sessions: Vec<SessionId>) -> Self {
        Self {
            event: Envelope::now(event),
            exclude_session: None,
            only_sessions: Some(sessions),
        }
    }

    /// Whether the session should receive this envelope.
    pub fn concerns(&self, session_id: SessionId) -> bool {
        if self.exclude_session == Some(session_id) {
            return false;
        }
        match &self.only_sessions {
            Some(sessions) => sessions.contains(&session_id),
            None => true,
        }
    }
}

/// The name of the per-map channel.
pub fn map_channel(map_id: &MapId) -> String {
    format!("map:{map_id}:events")
}

/// The name of the per-user channel for directed delivery.
pub fn user_channel(user_id: &UserId) -> String {
    format!("user:{user_id}:events")
}

/// A closable stream of bus events.
///
/// Dropping the subscription stops the underlying forwarder. `next`
/// returning `None` means the subscription ended (transport loss or bus
/// teardown) and the caller should resubscribe if still interested.
pub struct Subscription {
    rx: mpsc::Receiver<BusEnvelope>,
    _stop: DropGuard,
}

impl Subscription {
    /// Receives the next event, or `None` once the subscription ended.
    pub async fn next(&mut self) -> Option<BusEnvelope> {
        self.rx.recv().await
    }
}

/// Pub/sub transport mirroring fan-out across nodes.
///
/// Within a channel a single publisher's order is preserved; across
/// channels and publishers the interleaving is arbitrary.
#[async_trait]
pub trait EventBus {
    /// Publishes on a raw channel name. Fire-and-forget.
    async fn publish_channel(&self, channel: &str, envelope: BusEnvelope);

    /// Subscribes to a raw channel name.
    async fn subscribe_channel(&self, channel: &str) -> Result<Subscription, EventBusError>;

    /// Publishes a map-wide event.
    async fn publish(&self, map_id: &MapId, envelope: BusEnvelope) {
        self.publish_channel(&map_channel(map_id), envelope).await
    }

    /// Publishes a directed event on a user channel.
    async fn publish_user(&self, user_id: &UserId, envelope: BusEnvelope) {
        self.publish_channel(&user_channel(user_id), envelope).await
    }

    /// Subscribes to a map channel.
    async fn subscribe(&self, map_id: &MapId) -> Result<Subscription, EventBusError> {
        self.subscribe_channel(&map_channel(map_id)).await
    }

    /// Subscribes to a user channel.
    async fn subscribe_user(&self, user_id: &UserId) -> Result<Subscription, EventBusError> {
        self.subscribe_channel(&user_channel(user_id)).await
    }
}

/// Process-local bus built on per-channel broadcast queues.
#[derive(Default)]
pub struct MemoryEventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<BusEnvelope>>>,
}

impl MemoryEventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish_channel(&self, channel: &str, envelope: BusEnvelope) {
        let sender = self.channels.lock().get(channel).cloned();
        let Some(sender) = sender else {
            // nobody listens; at-most-once allows dropping outright
            return;
        };
        ::metrics::counter!(METRICS_ID_NODE_EVENTS_PUBLISHED).increment(1);
        if sender.send(envelope).is_err() {
            // last receiver is gone, forget the channel
            let mut channels = self.channels.lock();
            if channels
                .get(channel)
                .is_some_and(|sender| sender.receiver_count() == 0)
            {
                channels.remove(channel);
            }
        }
    }

    async fn subscribe_channel(&self, channel: &str) -> Result<Subscription, EventBusError> {
        let mut rx = {
            let mut channels = self.channels.lock();
            channels
                .entry(channel.to_owned())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };
        let (tx, out_rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        let forwarder_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = forwarder_cancel.cancelled() => return,
                    item = rx.recv() => match item {
                        Ok(envelope) => {
                            if tx.send(envelope).await.is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            ::metrics::counter!(METRICS_ID_NODE_EVENTS_DROPPED)
                                .increment(skipped);
                            tracing::warn!("slow bus subscriber skipped {skipped} events");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });
        Ok(Subscription {
            rx: out_rx,
            _stop: cancel.drop_guard(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plaza_types::Timestamp;
    use plaza_types::api::v1::{UserLeft, error_codes};
    use std::time::Duration;

    fn event(n: u64) -> BusEnvelope {
        let mut envelope = BusEnvelope::broadcast(ServerEvent::UserLeft(UserLeft {
            session_id: SessionId::random(),
            user_id: UserId::from("ada"),
        }));
        envelope.event.timestamp = Timestamp::from_millis(n);
        envelope
    }

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber_in_order() {
        let bus = MemoryEventBus::new();
        let map = MapId::from("m1");
        let mut first = bus.subscribe(&map).await.unwrap();
        let mut second = bus.subscribe(&map).await.unwrap();
        for n in 0..3 {
            bus.publish(&map, event(n)).await;
        }
        for subscriber in [&mut first, &mut second] {
            for n in 0..3 {
                let received = subscriber.next().await.unwrap();
                assert_eq!(received.event.timestamp.as_millis(), n);
            }
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = MemoryEventBus::new();
        bus.publish(&MapId::from("m1"), event(0)).await;
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let bus = MemoryEventBus::new();
        let mut m1 = bus.subscribe(&MapId::from("m1")).await.unwrap();
        bus.publish(&MapId::from("m2"), event(7)).await;
        bus.publish(&MapId::from("m1"), event(1)).await;
        assert_eq!(m1.next().await.unwrap().event.timestamp.as_millis(), 1);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_events_but_survives() {
        let bus = MemoryEventBus::new();
        let map = MapId::from("m1");
        let mut subscriber = bus.subscribe(&map).await.unwrap();
        let total = (CHANNEL_CAPACITY + SUBSCRIPTION_BUFFER + 100) as u64;
        for n in 0..total {
            bus.publish(&map, event(n)).await;
        }
        // drain whatever survived; the tail must include the newest event
        let mut last = None;
        loop {
            match tokio::time::timeout(Duration::from_millis(200), subscriber.next()).await {
                Ok(Some(envelope)) => last = Some(envelope.event.timestamp.as_millis()),
                Ok(None) | Err(_) => break,
            }
        }
        assert_eq!(last, Some(total - 1));
    }

    #[test]
    fn concerns_applies_exclusion_and_targeting() {
        let me = SessionId::random();
        let other = SessionId::random();
        let excluded = BusEnvelope::excluding(
            ServerEvent::Error(plaza_types::api::v1::ErrorFrame::new(
                error_codes::INTERNAL_ERROR,
                "x",
            )),
            me,
        );
        assert!(!excluded.concerns(me));
        assert!(excluded.concerns(other));

        let targeted = BusEnvelope::targeted(
            ServerEvent::Error(plaza_types::api::v1::ErrorFrame::new(
                error_codes::INTERNAL_ERROR,
                "x",
            )),
            vec![me],
        );
        assert!(targeted.concerns(me));
        assert!(!targeted.concerns(other));
    }
}
