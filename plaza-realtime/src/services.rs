//! Core services that make up a plaza realtime node.
//!
//! This module exposes all internal services used by the node to manage
//! connections, presence, POI membership, cross-node fan-out, signaling and
//! rate limiting. Each service encapsulates a specific responsibility and
//! can be used by higher-level components such as the websocket API or the
//! hosting application.
//!
//! # Services overview
//!
//! - [`rate_limiter`] – per-(user, action) quota enforcement.
//! - [`presence`] – TTL'd session presence store.
//! - [`poi_registry`] – atomic capacity-bounded POI membership.
//! - [`event_bus`] – pub/sub channels mirroring fan-out across nodes.
//! - [`hub`] – socket ownership, per-connection queues, map fan-out.
//! - [`router`] – inbound frame dispatch and state mutation.
//! - [`signaling`] – WebRTC offer/answer/ICE relay inside POIs and calls.
//! - [`poi_lifecycle`] – POI create/update/delete announcements for the
//!   external durable layer.
//! - [`reaper`] – background removal of abandoned sessions.

pub(crate) mod reaper;

pub mod event_bus;
pub mod hub;
pub mod poi_lifecycle;
pub mod poi_registry;
pub mod presence;
pub mod rate_limiter;
pub mod router;
pub mod signaling;
