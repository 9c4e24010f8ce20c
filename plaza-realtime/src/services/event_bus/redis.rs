//! Redis pub/sub event bus.
//!
//! Publishes go through a multiplexed connection with a short timeout and
//! are fire-and-forget. Each subscription owns a dedicated pub/sub
//! connection feeding a local channel; when the connection is lost the
//! subscription stream ends and the hub resubscribes.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt as _;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::metrics::METRICS_ID_NODE_EVENTS_PUBLISHED;
use crate::services::event_bus::{
    BusEnvelope, EventBus, EventBusError, SUBSCRIPTION_BUFFER, Subscription,
};

/// Event bus backed by Redis pub/sub channels.
pub struct RedisEventBus {
    client: redis::Client,
    conn: ConnectionManager,
    publish_timeout: Duration,
}

impl RedisEventBus {
    /// Connects the publishing side; subscriptions open their own
    /// connections lazily.
    pub async fn connect(url: &str, publish_timeout: Duration) -> eyre::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            client,
            conn,
            publish_timeout,
        })
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish_channel(&self, channel: &str, envelope: BusEnvelope) {
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!("could not encode bus envelope: {err:?}");
                return;
            }
        };
        let mut conn = self.conn.clone();
        let publish = async {
            redis::cmd("PUBLISH")
                .arg(channel)
                .arg(payload)
                .query_async::<()>(&mut conn)
                .await
        };
        match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(Ok(())) => {
                ::metrics::counter!(METRICS_ID_NODE_EVENTS_PUBLISHED).increment(1);
            }
            // at-most-once: log, never retry
            Ok(Err(err)) => tracing::warn!("bus publish on {channel} failed: {err:?}"),
            Err(_) => tracing::warn!(
                "bus publish on {channel} timed out after {:?}",
                self.publish_timeout
            ),
        }
    }

    async fn subscribe_channel(&self, channel: &str) -> Result<Subscription, EventBusError> {
        let (tx, out_rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let client = self.client.clone();
        let channel = channel.to_owned();
        tokio::spawn(async move {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(pubsub) => pubsub,
                Err(err) => {
                    tracing::warn!("could not open pub/sub connection for {channel}: {err:?}");
                    return;
                }
            };
            if let Err(err) = pubsub.subscribe(&channel).await {
                tracing::warn!("could not subscribe to {channel}: {err:?}");
                return;
            }
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    msg = stream.next() => {
                        let Some(msg) = msg else {
                            // connection lost; the consumer sees the stream
                            // end and resubscribes
                            tracing::debug!("pub/sub stream for {channel} ended");
                            return;
                        };
                        let payload: String = match msg.get_payload() {
                            Ok(payload) => payload,
                            Err(err) => {
                                tracing::warn!("non-text payload on {channel}: {err:?}");
                                continue;
                            }
                        };
                        match serde_json::from_str::<BusEnvelope>(&payload) {
                            Ok(envelope) => {
                                if tx.send(envelope).await.is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                tracing::warn!("undecodable bus envelope on {channel}: {err:?}");
                            }
                        }
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
