//! Metrics definitions for the realtime node.
//!
//! This module defines all metrics keys used by the service and provides a
//! helper [`describe_metrics`] to set metadata for each metric using the
//! `metrics` crate.

/// Metrics key for currently registered websocket connections.
pub const METRICS_ID_NODE_CONNECTIONS_OPEN: &str = "plaza.realtime.node.connections.open";
/// Metrics key for inbound frames handled by the router.
pub const METRICS_ID_NODE_FRAMES_INBOUND: &str = "plaza.realtime.node.frames.inbound";
/// Metrics key for inbound frames that failed to decode.
pub const METRICS_ID_NODE_FRAMES_DECODE_ERROR: &str = "plaza.realtime.node.frames.decode_error";
/// Metrics key for events published on the bus.
pub const METRICS_ID_NODE_EVENTS_PUBLISHED: &str = "plaza.realtime.node.events.published";
/// Metrics key for bus events dropped because a subscriber lagged.
pub const METRICS_ID_NODE_EVENTS_DROPPED: &str = "plaza.realtime.node.events.dropped";
/// Metrics key for the number of connections reached by one fan-out.
pub const METRICS_ID_NODE_FANOUT_SIZE: &str = "plaza.realtime.node.fanout.size";
/// Metrics key for connections closed under the stalled-peer policy.
pub const METRICS_ID_NODE_CONNECTIONS_STALLED: &str = "plaza.realtime.node.connections.stalled";
/// Metrics key for rate-limited actions.
pub const METRICS_ID_NODE_RATE_LIMITED: &str = "plaza.realtime.node.rate_limited";
/// Metrics key for sessions removed by the reaper.
pub const METRICS_ID_NODE_SESSIONS_REAPED: &str = "plaza.realtime.node.sessions.reaped";
/// Metrics key for signaling frames relayed between peers.
pub const METRICS_ID_NODE_SIGNALS_RELAYED: &str = "plaza.realtime.node.signals.relayed";
/// Metrics key for signaling frames dropped because the target was gone.
pub const METRICS_ID_NODE_SIGNALS_UNREACHABLE: &str = "plaza.realtime.node.signals.unreachable";

/// Describe all metrics used by the service.
///
/// This calls the `describe_*` functions from the `metrics` crate to set
/// metadata on the different metrics.
pub fn describe_metrics() {
    metrics::describe_gauge!(
        METRICS_ID_NODE_CONNECTIONS_OPEN,
        metrics::Unit::Count,
        "Number of currently registered websocket connections"
    );

    metrics::describe_counter!(
        METRICS_ID_NODE_FRAMES_INBOUND,
        metrics::Unit::Count,
        "Number of inbound frames handled by the router"
    );

    metrics::describe_counter!(
        METRICS_ID_NODE_FRAMES_DECODE_ERROR,
        metrics::Unit::Count,
        "Number of inbound frames that failed to decode"
    );

    metrics::describe_counter!(
        METRICS_ID_NODE_EVENTS_PUBLISHED,
        metrics::Unit::Count,
        "Number of events published on the cross-node bus"
    );

    metrics::describe_counter!(
        METRICS_ID_NODE_EVENTS_DROPPED,
        metrics::Unit::Count,
        "Number of bus events dropped because a subscriber lagged"
    );

    metrics::describe_histogram!(
        METRICS_ID_NODE_FANOUT_SIZE,
        metrics::Unit::Count,
        "Number of connections reached by one fan-out"
    );

    metrics::describe_counter!(
        METRICS_ID_NODE_CONNECTIONS_STALLED,
        metrics::Unit::Count,
        "Number of connections closed under the stalled-peer policy"
    );

    metrics::describe_counter!(
        METRICS_ID_NODE_RATE_LIMITED,
        metrics::Unit::Count,
        "Number of actions denied by the rate limiter"
    );

    metrics::describe_counter!(
        METRICS_ID_NODE_SESSIONS_REAPED,
        metrics::Unit::Count,
        "Number of sessions removed by the reaper"
    );

    metrics::describe_counter!(
        METRICS_ID_NODE_SIGNALS_RELAYED,
        metrics::Unit::Count,
        "Number of signaling frames relayed between peers"
    );

    metrics::describe_counter!(
        METRICS_ID_NODE_SIGNALS_UNREACHABLE,
        metrics::Unit::Count,
        "Number of signaling frames dropped because the target was gone"
    )
}
