//! # v1 wire protocol types
//!
//! Data transfer objects exchanged over the websocket and mirrored onto the
//! cross-node event bus.
//!
//! Both directions use JSON text frames with an adjacently tagged envelope:
//! `{"type": "...", "data": {...}}`. Server-originated frames additionally
//! carry a top-level `timestamp`, assigned at ingress. The tagged sums below
//! keep dispatch compiler-checked; nothing past the router boundary handles
//! untyped JSON maps, except the opaque SDP/ICE payloads the relay forwards
//! verbatim.

use serde::{Deserialize, Serialize};

use crate::{CallId, MapId, PoiId, Position, SessionId, Timestamp, UserId};

/// Well-known wire error codes carried by [`ErrorFrame`].
///
/// Clients use these to decide whether to retry (rate/infra), reconcile
/// (not-found), or surface to the user (validation/capacity).
pub mod error_codes {
    /// Malformed payload or out-of-range value; no state was mutated.
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    /// Unknown frame type or malformed JSON; the connection stays open.
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
    /// The per-user bucket for this action is depleted.
    pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
    /// The referenced session is absent from the presence store.
    pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
    /// The referenced POI is absent or was deleted.
    pub const POI_NOT_FOUND: &str = "POI_NOT_FOUND";
    /// The POI participant set is at `max_participants`.
    pub const POI_CAPACITY: &str = "POI_CAPACITY";
    /// The signaling target has no live session on this map.
    pub const CALL_UNREACHABLE: &str = "CALL_UNREACHABLE";
    /// A store or bus operation failed; the client may retry.
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Plaza-specific websocket close codes.
pub mod close_codes {
    /// No inbound frame arrived within the idle threshold plus grace.
    pub const IDLE_TIMEOUT: u16 = 4001;
    /// The outbound queue overflowed or a write deadline was missed.
    pub const STALLED: u16 = 4002;
    /// Too many consecutive undecodable frames.
    pub const PROTOCOL_ERROR: u16 = 4003;
}

/// A frame sent by a client over the websocket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Liveness ping; extends the session TTL, gets no reply.
    Heartbeat,
    /// Avatar position update.
    AvatarMove(AvatarMove),
    /// Request to join a POI (implicitly leaving the current one).
    PoiJoined(PoiJoinRequest),
    /// Request to leave the current POI.
    PoiLeft,
    /// Ask a user on the same map to start a 1-1 call.
    CallRequest(CallSignal),
    /// Accept a pending 1-1 call.
    CallAccept(CallSignal),
    /// Reject a pending 1-1 call.
    CallReject(CallSignal),
    /// Hang up a 1-1 call.
    CallEnd(CallSignal),
    /// WebRTC SDP offer for a 1-1 call.
    CallOffer(CallSignal),
    /// WebRTC SDP answer for a 1-1 call.
    CallAnswer(CallSignal),
    /// WebRTC ICE candidate for a 1-1 call.
    CallIce(CallSignal),
    /// WebRTC SDP offer for a POI group call.
    GroupCallOffer(GroupCallSignal),
    /// WebRTC SDP answer for a POI group call.
    GroupCallAnswer(GroupCallSignal),
    /// WebRTC ICE candidate for a POI group call.
    GroupCallIce(GroupCallSignal),
    /// Client-side error report; logged and not forwarded.
    Error(ErrorFrame),
}

/// An event originated (or relayed) by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// First frame after registration, confirming the connection identity.
    Welcome(Welcome),
    /// Another session on the map moved its avatar.
    AvatarMoved(AvatarMoved),
    /// A POI was created on the map.
    PoiCreated(PoiSummary),
    /// A POI's metadata changed.
    PoiUpdated(PoiSummary),
    /// A POI was deleted; its members have been evicted.
    PoiDeleted(PoiDeleted),
    /// A session joined a POI.
    PoiJoined(PoiMembershipChange),
    /// A session left a POI.
    PoiLeft(PoiMembershipChange),
    /// A stale session was reaped from the map.
    UserLeft(UserLeft),
    /// A 1-1 call invitation, relayed to the callee.
    CallRequest(CallSignal),
    /// A 1-1 call acceptance, relayed to the caller.
    CallAccept(CallSignal),
    /// A 1-1 call rejection, relayed to the caller.
    CallReject(CallSignal),
    /// A 1-1 call hang-up, relayed to the peer.
    CallEnd(CallSignal),
    /// A relayed 1-1 SDP offer.
    CallOffer(CallSignal),
    /// A relayed 1-1 SDP answer.
    CallAnswer(CallSignal),
    /// A relayed 1-1 ICE candidate.
    CallIce(CallSignal),
    /// The POI reached two participants; a group call now exists.
    GroupCallStarted(GroupCallStarted),
    /// A further participant joined the POI group call.
    GroupCallPeerJoined(GroupCallPeer),
    /// A participant left the POI group call.
    GroupCallPeerLeft(GroupCallPeer),
    /// A relayed group-call SDP offer.
    GroupCallOffer(GroupCallSignal),
    /// A relayed group-call SDP answer.
    GroupCallAnswer(GroupCallSignal),
    /// A relayed group-call ICE candidate.
    GroupCallIce(GroupCallSignal),
    /// An in-band error report for the receiving client.
    Error(ErrorFrame),
}

/// The unit put on the socket and on the bus: a [`ServerEvent`] plus the
/// server-assigned ingress timestamp.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The typed event.
    #[serde(flatten)]
    pub event: ServerEvent,
    /// Server-assigned at ingress.
    pub timestamp: Timestamp,
}

impl Envelope {
    /// Wraps an event with the current wall-clock time.
    pub fn now(event: ServerEvent) -> Self {
        Self {
            event,
            timestamp: Timestamp::now(),
        }
    }
}

/// Payload of [`ClientFrame::AvatarMove`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AvatarMove {
    /// The new avatar position.
    pub position: Position,
}

/// Payload of [`ClientFrame::PoiJoined`].
///
/// `max_participants` is the capacity the external durable layer recorded
/// for the POI; the registry enforces it atomically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoiJoinRequest {
    /// The POI to join.
    pub poi_id: PoiId,
    /// The POI's capacity bound, `>= 1`.
    pub max_participants: u32,
}

/// Payload of [`ServerEvent::Welcome`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    /// The session this connection is bound to.
    pub session_id: SessionId,
    /// The user owning the session.
    pub user_id: UserId,
    /// The map this connection subscribes to.
    pub map_id: MapId,
    /// Server wall-clock at registration, for client clock skew estimates.
    pub server_time: Timestamp,
}

/// Payload of [`ServerEvent::AvatarMoved`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AvatarMoved {
    /// The session that moved.
    pub session_id: SessionId,
    /// The user owning the session.
    pub user_id: UserId,
    /// The new position.
    pub position: Position,
}

/// Payload of [`ServerEvent::PoiCreated`] and [`ServerEvent::PoiUpdated`].
///
/// The durable POI metadata lives outside the core; the optional fields
/// mirror whatever the external layer chose to announce.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoiSummary {
    /// The POI.
    pub poi_id: PoiId,
    /// Display name, if announced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Map position, if announced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Capacity bound, if announced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_participants: Option<u32>,
}

/// Payload of [`ServerEvent::PoiDeleted`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoiDeleted {
    /// The deleted POI.
    pub poi_id: PoiId,
    /// The sessions that were members at deletion time.
    pub evicted: Vec<SessionId>,
}

/// Payload of [`ServerEvent::PoiJoined`] and [`ServerEvent::PoiLeft`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoiMembershipChange {
    /// The POI whose participant set changed.
    pub poi_id: PoiId,
    /// The session that joined or left.
    pub session_id: SessionId,
    /// The user owning the session.
    pub user_id: UserId,
    /// The participant count right after the change, as returned by the
    /// registry operation that performed it.
    pub current_count: u32,
}

/// Payload of [`ServerEvent::UserLeft`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserLeft {
    /// The reaped session.
    pub session_id: SessionId,
    /// The user owning the session.
    pub user_id: UserId,
}

/// A directed 1-1 call signaling frame.
///
/// Inbound, `to_user_id` names the target and `from_user_id` is ignored;
/// when relaying, the server stamps `from_user_id` with the sender's
/// identity so peers cannot impersonate each other. `payload` carries the
/// opaque SDP/ICE blob and is never inspected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallSignal {
    /// Caller-assigned id correlating the frames of one call.
    pub call_id: CallId,
    /// The target user.
    pub to_user_id: UserId,
    /// The sending user; server-stamped on relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<UserId>,
    /// Opaque SDP/ICE blob, forwarded verbatim.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

/// A directed group-call signaling frame inside one POI.
///
/// The group call is implicit in the POI; `call_id` correlates the peer
/// connections of one call generation. Stamping rules match [`CallSignal`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupCallSignal {
    /// Id correlating the frames of one group call.
    pub call_id: CallId,
    /// The target peer inside the shared POI.
    pub peer_id: UserId,
    /// The sending user; server-stamped on relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<UserId>,
    /// Opaque SDP/ICE blob, forwarded verbatim.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

/// Payload of [`ServerEvent::GroupCallStarted`].
///
/// Each receiver learns its current peer set; for every peer pair the side
/// with the lexically greater user id initiates the offer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupCallStarted {
    /// The POI hosting the call.
    pub poi_id: PoiId,
    /// The other current participants, as user ids.
    pub peers: Vec<UserId>,
}

/// Payload of [`ServerEvent::GroupCallPeerJoined`] and
/// [`ServerEvent::GroupCallPeerLeft`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupCallPeer {
    /// The POI hosting the call.
    pub poi_id: PoiId,
    /// The peer that joined or left.
    pub peer_id: UserId,
}

/// An in-band error, sent to exactly one client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    /// One of [`error_codes`].
    pub code: String,
    /// Human-readable detail.
    pub message: String,
    /// Seconds to wait before retrying, for rate-limit errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorFrame {
    /// Builds an error frame without a retry hint.
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_owned(),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Builds a rate-limit error frame carrying `retry_after` seconds.
    pub fn rate_limited(message: impl Into<String>, retry_after: u64) -> Self {
        Self {
            code: error_codes::RATE_LIMIT_EXCEEDED.to_owned(),
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_wire_shape() {
        let frame = ClientFrame::AvatarMove(AvatarMove {
            position: Position {
                lat: 40.7128,
                lng: -74.006,
            },
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "avatar_move");
        assert_eq!(json["data"]["position"]["lat"], 40.7128);
    }

    #[test]
    fn heartbeat_needs_no_data() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Heartbeat);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let res = serde_json::from_str::<ClientFrame>(r#"{"type":"teleport","data":{}}"#);
        assert!(res.is_err());
    }

    #[test]
    fn envelope_carries_top_level_timestamp() {
        let envelope = Envelope {
            event: ServerEvent::UserLeft(UserLeft {
                session_id: SessionId::random(),
                user_id: UserId::from("ada"),
            }),
            timestamp: Timestamp::from_millis(1234),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "user_left");
        assert_eq!(json["timestamp"], 1234);
        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn call_signal_keeps_payload_opaque() {
        let json = r#"{
            "type": "call_offer",
            "data": {
                "call_id": "c-1",
                "to_user_id": "bob",
                "payload": {"sdp": "v=0...", "kind": "offer"}
            }
        }"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        let ClientFrame::CallOffer(signal) = frame else {
            panic!("expected call_offer");
        };
        assert_eq!(signal.from_user_id, None);
        assert_eq!(signal.payload["kind"], "offer");
    }
}
