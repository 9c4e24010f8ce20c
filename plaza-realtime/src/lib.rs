#![deny(missing_docs)]
//! This crate provides the realtime coordination engine of a plaza node.
//!
//! A plaza deployment is a fleet of backend nodes in front of a shared
//! key-value store: many users occupy a common map, each streams its avatar
//! position, and users congregate at capacity-bounded POIs that double as
//! group-call rooms. This crate is the engine one node runs: the websocket
//! hub and fan-out, the TTL'd presence layer, the atomic POI membership
//! registry, the cross-node event bus mirroring, call signaling relay, rate
//! limiting and the reaper. The durable Users/Maps/POIs storage, session
//! issuance and the surrounding REST routes live in the hosting
//! application.
//!
//! The main entry point is the [`RealtimeServiceBuilder`]. It wires the
//! injected stores (see [`RealtimeStores`]; process-local for a single
//! node, store-backed for a fleet) into the hub, router and relay, spawns
//! the reaper and returns an `axum::Router` to incorporate into a larger
//! `axum` server, plus a `JoinHandle` for the reaper task.
//!
//! If internal services encounter a fatal error, the provided
//! `CancellationToken` will be cancelled, allowing the hosting application
//! to handle the shutdown process gracefully. Additionally, the token can
//! be cancelled externally to signal the service to stop. To ensure a
//! graceful shutdown, the hosting application should call
//! [`RealtimeServiceBuilder`]'s shutdown-aware handles (drain the hub, then
//! await the reaper handle) after cancelling the token.
//!
//! Clients connect via websockets. Axum supports both HTTP/1.1 and HTTP/2.0
//! websocket connections, therefore the `/ws` route accepts connections
//! with `any`.

use std::sync::{Arc, atomic::AtomicBool};
use std::time::Duration;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::RealtimeNodeConfig;
use crate::services::event_bus::EventBusService;
use crate::services::hub::{ConnectionHub, HubArgs};
use crate::services::poi_lifecycle::PoiLifecycle;
use crate::services::poi_registry::PoiRegistryService;
use crate::services::presence::PresenceService;
use crate::services::rate_limiter::{RateLimitTable, RateLimiterService};
use crate::services::reaper::ReaperTaskArgs;
use crate::services::router::{MessageRouter, RouterArgs};
use crate::services::signaling::SignalingRelay;

pub mod config;
pub mod metrics;
pub mod services;

pub(crate) mod api;

/// The injected store implementations the engine runs on.
///
/// Every field follows the same pattern: a trait object with a
/// process-local implementation (tests, single-node dev) and a store-backed
/// one (production fleets). Mixing is fine, e.g. a memory rate limiter in
/// front of store-backed membership.
#[derive(Clone)]
pub struct RealtimeStores {
    /// TTL'd session presence.
    pub presence: PresenceService,
    /// Atomic POI membership.
    pub registry: PoiRegistryService,
    /// Per-(user, action) quotas.
    pub rate_limiter: RateLimiterService,
    /// Cross-node pub/sub.
    pub bus: EventBusService,
}

impl RealtimeStores {
    /// Process-local implementations for all four stores.
    ///
    /// Correct for a single node only: nothing is shared with other backend
    /// nodes.
    pub fn in_memory(rate_limits: RateLimitTable) -> Self {
        Self {
            presence: Arc::new(services::presence::MemoryPresenceStore::new()),
            registry: Arc::new(services::poi_registry::MemoryPoiRegistry::new()),
            rate_limiter: Arc::new(services::rate_limiter::MemoryRateLimiter::new(rate_limits)),
            bus: Arc::new(services::event_bus::MemoryEventBus::new()),
        }
    }

    /// Store-backed implementations speaking to the configured key-value
    /// store and bus.
    #[cfg(feature = "redis")]
    pub async fn connect(config: &RealtimeNodeConfig) -> eyre::Result<Self> {
        use eyre::Context as _;
        use secrecy::ExposeSecret as _;

        let kv_url = config.kv_store_url.expose_secret();
        let bus_url = config.bus_url.expose_secret();
        tracing::info!("connecting to key-value store..");
        let presence = services::presence::redis::RedisPresenceStore::connect(
            kv_url,
            config.store_op_timeout,
        )
        .await
        .context("while connecting the presence store")?;
        let registry = services::poi_registry::redis::RedisPoiRegistry::connect(
            kv_url,
            config.store_op_timeout,
        )
        .await
        .context("while connecting the poi registry")?;
        let rate_limiter = services::rate_limiter::redis::RedisRateLimiter::connect(
            kv_url,
            config.rate_limits(),
            config.store_op_timeout,
        )
        .await
        .context("while connecting the rate limiter")?;
        tracing::info!("connecting to event bus..");
        let bus =
            services::event_bus::redis::RedisEventBus::connect(bus_url, config.bus_publish_timeout)
                .await
                .context("while connecting the event bus")?;
        Ok(Self {
            presence: Arc::new(presence),
            registry: Arc::new(registry),
            rate_limiter: Arc::new(rate_limiter),
            bus: Arc::new(bus),
        })
    }
}

/// [`RealtimeServiceBuilder`] wires the injected stores into the realtime
/// engine and produces the axum [`Router`].
pub struct RealtimeServiceBuilder {
    config: RealtimeNodeConfig,
    root: Router,
    hub: ConnectionHub,
    router: MessageRouter,
    stores: RealtimeStores,
    poi_lifecycle: PoiLifecycle,
    reaper: tokio::task::JoinHandle<Result<(), eyre::Error>>,
}

impl RealtimeServiceBuilder {
    /// Initializes the realtime engine.
    ///
    /// This sets up the connection hub over the injected stores, the
    /// signaling relay and message router, spawns the reaper task and
    /// prepares the health endpoints.
    pub fn init(
        config: RealtimeNodeConfig,
        stores: RealtimeStores,
        cancellation_token: CancellationToken,
    ) -> Self {
        ::metrics::gauge!(crate::metrics::METRICS_ID_NODE_CONNECTIONS_OPEN).set(0);

        tracing::info!("init connection hub..");
        let hub = ConnectionHub::new(HubArgs {
            bus: Arc::clone(&stores.bus),
            registry: Arc::clone(&stores.registry),
            outbound_queue_capacity: config.outbound_queue_capacity,
            cancellation_token: cancellation_token.clone(),
        });
        let relay = SignalingRelay::new(
            hub.clone(),
            Arc::clone(&stores.presence),
            Arc::clone(&stores.registry),
            Arc::clone(&stores.bus),
        );
        let router = MessageRouter::new(RouterArgs {
            presence: Arc::clone(&stores.presence),
            registry: Arc::clone(&stores.registry),
            rate_limiter: Arc::clone(&stores.rate_limiter),
            bus: Arc::clone(&stores.bus),
            relay,
            session_ttl: config.session_ttl,
        });
        let poi_lifecycle = PoiLifecycle::new(
            Arc::clone(&stores.registry),
            Arc::clone(&stores.presence),
            Arc::clone(&stores.bus),
        );

        tracing::info!("spawning reaper..");
        let started = Arc::new(AtomicBool::new(false));
        let reaper = tokio::spawn(services::reaper::reaper_task(ReaperTaskArgs {
            presence: Arc::clone(&stores.presence),
            registry: Arc::clone(&stores.registry),
            bus: Arc::clone(&stores.bus),
            sweep_interval: config.reaper_interval,
            idle_threshold: config.idle_threshold,
            started: Arc::clone(&started),
            cancellation_token,
        }));

        let root = Router::new().merge(api::health::routes(started));
        Self {
            config,
            root,
            hub,
            router,
            stores,
            poi_lifecycle,
            reaper,
        }
    }

    /// The presence store, for the hosting session endpoints.
    pub fn presence(&self) -> PresenceService {
        Arc::clone(&self.stores.presence)
    }

    /// The POI registry, for the hosting POI endpoints.
    pub fn poi_registry(&self) -> PoiRegistryService {
        Arc::clone(&self.stores.registry)
    }

    /// The rate limiter, for gating `create_session` and `create_poi` in
    /// the hosting REST layer.
    pub fn rate_limiter(&self) -> RateLimiterService {
        Arc::clone(&self.stores.rate_limiter)
    }

    /// The POI lifecycle handle the hosting layer calls after its durable
    /// store acknowledged a create/update/delete.
    pub fn poi_lifecycle(&self) -> PoiLifecycle {
        self.poi_lifecycle.clone()
    }

    /// The connection hub, mainly to drain it on shutdown.
    pub fn hub(&self) -> ConnectionHub {
        self.hub.clone()
    }

    /// The configured drain window for [`ConnectionHub::shutdown`].
    pub fn shutdown_drain(&self) -> Duration {
        self.config.shutdown_drain
    }

    /// Build the `axum` [`Router`] with the websocket and health routes.
    ///
    /// # Returns
    ///
    /// Returns a tuple containing:
    /// - An Axum `Router` instance to serve.
    /// - A `JoinHandle` for the reaper task.
    pub fn build(self) -> (axum::Router, tokio::task::JoinHandle<eyre::Result<()>>) {
        let ws_routes = api::ws::routes(api::ws::WsArgs {
            router: self.router,
            hub: self.hub,
            presence: Arc::clone(&self.stores.presence),
            version_req: self.config.version_req.clone(),
            max_message_size: self.config.ws_max_message_size,
            write_timeout: self.config.write_timeout,
            liveness_deadline: self.config.liveness_deadline(),
        });
        (
            self.root
                .merge(ws_routes)
                .layer(TraceLayer::new_for_http()),
            self.reaper,
        )
    }
}
