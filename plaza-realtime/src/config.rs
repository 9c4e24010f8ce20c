//! Configuration types and CLI/environment parsing for a plaza realtime node.
//!
//! Concrete deployments may have a more detailed config and can use the
//! exposed [`RealtimeNodeConfig`] and flatten it with `#[clap(flatten)]`.
//!
//! Additionally this module defines the [`Environment`] to assert dev-only
//! code paths.

use std::time::Duration;

use clap::{Parser, ValueEnum};
use secrecy::SecretString;
use semver::VersionReq;

use crate::services::rate_limiter::{Quota, RateAction, RateLimitTable};

/// The environment the service is running in.
///
/// Main usage for the `Environment` is to call
/// [`Environment::assert_is_dev`]. Services that are intended for `dev` only
/// (like the in-memory store wiring of the example binary) shall assert that
/// they are called from the `dev` environment.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Environment {
    /// Production environment.
    Prod,
    /// Development environment.
    Dev,
}

impl Environment {
    /// Asserts that `Environment` is `dev`. Panics if not the case.
    pub fn assert_is_dev(&self) {
        assert!(matches!(self, Environment::Dev), "Is not dev environment")
    }
}

/// The configuration for the plaza realtime core.
///
/// It can be configured via environment variables or command line arguments
/// using `clap`.
#[derive(Parser, Debug)]
pub struct RealtimeNodeConfig {
    /// The environment of the realtime node (either `prod` or `dev`).
    #[clap(long, env = "PLAZA_NODE_ENVIRONMENT", default_value = "prod")]
    pub environment: Environment,

    /// The URL of the key-value store holding presence and POI membership.
    #[clap(
        long,
        env = "PLAZA_NODE_KV_STORE_URL",
        default_value = "redis://127.0.0.1:6379"
    )]
    pub kv_store_url: SecretString,

    /// The URL of the pub/sub bus mirroring fan-out across nodes.
    ///
    /// Usually the same instance as the key-value store.
    #[clap(
        long,
        env = "PLAZA_NODE_BUS_URL",
        default_value = "redis://127.0.0.1:6379"
    )]
    pub bus_url: SecretString,

    /// Max message size the websocket connection accepts.
    ///
    /// Default value: 64 kilobytes. SDP offers are the largest frames we
    /// relay and stay well below this.
    #[clap(long, env = "PLAZA_NODE_MAX_MESSAGE_SIZE", default_value = "65536")]
    pub ws_max_message_size: usize,

    /// Per-frame write deadline; a missed deadline closes the connection.
    #[clap(
        long,
        env = "PLAZA_NODE_WRITE_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub write_timeout: Duration,

    /// Capacity of the per-connection outbound queue.
    ///
    /// A connection whose queue overflows is considered stalled and closed.
    #[clap(long, env = "PLAZA_NODE_OUTBOUND_QUEUE_CAPACITY", default_value = "256")]
    pub outbound_queue_capacity: usize,

    /// The interval at which clients are expected to send heartbeats.
    #[clap(
        long,
        env = "PLAZA_NODE_HEARTBEAT_INTERVAL",
        default_value = "15s",
        value_parser = humantime::parse_duration
    )]
    pub heartbeat_interval: Duration,

    /// Sessions idle for longer than this are considered abandoned.
    #[clap(
        long,
        env = "PLAZA_NODE_IDLE_THRESHOLD",
        default_value = "5min",
        value_parser = humantime::parse_duration
    )]
    pub idle_threshold: Duration,

    /// Grace added to the idle threshold before the hub closes a silent
    /// connection.
    #[clap(
        long,
        env = "PLAZA_NODE_IDLE_GRACE",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub idle_grace: Duration,

    /// How often the reaper sweeps for abandoned sessions.
    #[clap(
        long,
        env = "PLAZA_NODE_REAPER_INTERVAL",
        default_value = "1min",
        value_parser = humantime::parse_duration
    )]
    pub reaper_interval: Duration,

    /// TTL of a presence session; refreshed by heartbeats and activity.
    #[clap(
        long,
        env = "PLAZA_NODE_SESSION_TTL",
        default_value = "30min",
        value_parser = humantime::parse_duration
    )]
    pub session_ttl: Duration,

    /// Per-operation timeout for key-value store calls.
    #[clap(
        long,
        env = "PLAZA_NODE_STORE_OP_TIMEOUT",
        default_value = "2s",
        value_parser = humantime::parse_duration
    )]
    pub store_op_timeout: Duration,

    /// Timeout for a single bus publish; publishes are fire-and-forget.
    #[clap(
        long,
        env = "PLAZA_NODE_BUS_PUBLISH_TIMEOUT",
        default_value = "500ms",
        value_parser = humantime::parse_duration
    )]
    pub bus_publish_timeout: Duration,

    /// Max time writers get to flush queued frames during shutdown.
    #[clap(
        long,
        env = "PLAZA_NODE_SHUTDOWN_DRAIN",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub shutdown_drain: Duration,

    /// Accepted SemVer versions of client protocols.
    #[clap(
        long,
        env = "PLAZA_NODE_ACCEPTED_VERSIONS",
        default_value = "^1",
        value_parser = VersionReq::parse
    )]
    pub version_req: VersionReq,

    /// Rate limit for session creation, per user.
    #[clap(
        long,
        env = "PLAZA_NODE_RATE_LIMIT_CREATE_SESSION",
        default_value = "10/1m",
        value_parser = Quota::parse
    )]
    pub rate_limit_create_session: Quota,

    /// Rate limit for avatar movement updates, per user.
    #[clap(
        long,
        env = "PLAZA_NODE_RATE_LIMIT_UPDATE_AVATAR",
        default_value = "60/1m",
        value_parser = Quota::parse
    )]
    pub rate_limit_update_avatar: Quota,

    /// Rate limit for POI creation, per user.
    #[clap(
        long,
        env = "PLAZA_NODE_RATE_LIMIT_CREATE_POI",
        default_value = "5/1m",
        value_parser = Quota::parse
    )]
    pub rate_limit_create_poi: Quota,

    /// Rate limit for POI joins, per user.
    #[clap(
        long,
        env = "PLAZA_NODE_RATE_LIMIT_JOIN_POI",
        default_value = "20/1m",
        value_parser = Quota::parse
    )]
    pub rate_limit_join_poi: Quota,
}

impl RealtimeNodeConfig {
    /// Collects the per-action quotas into the table the rate limiter is
    /// constructed with. Actions absent from the table are denied.
    pub fn rate_limits(&self) -> RateLimitTable {
        let mut table = RateLimitTable::default();
        table.insert(RateAction::CreateSession, self.rate_limit_create_session);
        table.insert(RateAction::UpdateAvatar, self.rate_limit_update_avatar);
        table.insert(RateAction::CreatePoi, self.rate_limit_create_poi);
        table.insert(RateAction::JoinPoi, self.rate_limit_join_poi);
        table
    }

    /// The deadline after which a connection without inbound frames is
    /// closed by the hub.
    pub fn liveness_deadline(&self) -> Duration {
        self.idle_threshold + self.idle_grace
    }
}
