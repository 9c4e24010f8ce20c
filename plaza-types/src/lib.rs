#![deny(missing_docs)]
//! Core type definitions for the plaza realtime backend.
//!
//! This crate groups together the strongly-typed values and message
//! structures shared between the realtime engine and the HTTP layer that
//! hosts it. It provides:
//!
//! * Thin wrappers around primitive values such as session, user, map and
//!   POI identifiers, with consistent serialization and display
//!   implementations.
//! * Geographic [`Position`]s with range validation.
//! * The ephemeral [`Session`] presence record.
//! * Versioned wire types for client/server communication (see [`api`]).
//!
//! Use these types to pass, store, and (de)serialize identifiers in a
//! type-safe way throughout your application.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod api;

/// A server-assigned identifier for one live presence session.
///
/// The session id doubles as the bearer token of the websocket upgrade, so
/// it must be unguessable. It is generated as a v4 UUID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generates a fresh random session id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a session id from its canonical string form.
    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(Self)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps the raw identifier.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// The id of a user, issued by the external identity layer.
    ///
    /// User ids are compared lexically when the signaling relay documents
    /// which side of a peer pair initiates an offer.
    UserId
);
string_id!(
    /// The id of a shared map, the unit of fan-out.
    MapId
);
string_id!(
    /// The id of a point of interest on a map.
    PoiId
);
string_id!(
    /// A caller-assigned id correlating the frames of one 1-1 call.
    CallId
);

/// A millisecond-precision UTC timestamp as carried on the wire.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The current wall-clock time.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(millis as u64)
    }

    /// Wraps a raw epoch-millisecond value.
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// The raw epoch-millisecond value.
    pub fn as_millis(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An avatar position on the shared map.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in degrees, must lie in `[-90, 90]`.
    pub lat: f64,
    /// Longitude in degrees, must lie in `[-180, 180]`.
    pub lng: f64,
}

impl Position {
    /// Returns `true` iff both coordinates are finite and within range.
    ///
    /// The boundary values themselves are valid.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// The ephemeral presence record tying one user to one map.
///
/// Sessions live in the presence store under a TTL that heartbeats keep
/// refreshed. `last_active` is monotone non-decreasing; `current_poi` is
/// only set while the session is listed in that POI's participant set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// The server-assigned session id.
    pub id: SessionId,
    /// The user owning this session.
    pub user_id: UserId,
    /// The map the session lives on.
    pub map_id: MapId,
    /// The avatar position last reported for this session.
    pub position: Position,
    /// Instant of the last liveness-implying activity.
    pub last_active: Timestamp,
    /// The POI the session currently occupies, if any.
    pub current_poi: Option<PoiId>,
}

impl Session {
    /// Creates a fresh session record with `last_active = now`.
    pub fn new(user_id: UserId, map_id: MapId, position: Position) -> Self {
        Self {
            id: SessionId::random(),
            user_id,
            map_id,
            position,
            last_active: Timestamp::now(),
            current_poi: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_accepts_exact_bounds() {
        assert!(Position { lat: 90.0, lng: 180.0 }.is_valid());
        assert!(Position { lat: -90.0, lng: -180.0 }.is_valid());
    }

    #[test]
    fn position_rejects_just_outside() {
        assert!(!Position { lat: 90.000001, lng: 0.0 }.is_valid());
        assert!(!Position { lat: 0.0, lng: -180.000001 }.is_valid());
        assert!(!Position { lat: f64::NAN, lng: 0.0 }.is_valid());
    }

    #[test]
    fn session_id_round_trips_through_string() {
        let id = SessionId::random();
        assert_eq!(SessionId::parse(&id.to_string()), Some(id));
        assert_eq!(SessionId::parse("not-a-uuid"), None);
    }
}
