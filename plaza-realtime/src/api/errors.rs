//! This module defines the [`WsError`] a connection's read loop may end
//! with, and how each ending renders as a websocket close frame.

use std::io::ErrorKind;

use axum::extract::ws::{CloseFrame, close_code};
use plaza_types::api::v1::close_codes;
use tracing::instrument;
use tungstenite::error::ProtocolError;

/// The ways a connection's read loop can end.
#[derive(Debug, thiserror::Error)]
pub(crate) enum WsError {
    /// The peer closed the socket (close frame or plain disconnect).
    #[error("connection closed by peer")]
    ConnectionClosed,
    /// The transport failed underneath us.
    #[error(transparent)]
    Axum(#[from] axum::Error),
    /// The hub cancelled the connection (stalled peer, superseded session,
    /// shutdown).
    #[error("connection closed by server")]
    Cancelled,
    /// No inbound frame within the liveness deadline.
    #[error("no inbound frame within the liveness deadline")]
    IdleTimeout,
    /// Too many consecutive undecodable frames.
    #[error("too many undecodable frames")]
    TooManyDecodeFailures,
    /// Too many infrastructure failures in a short window.
    #[error("too many infrastructure failures")]
    FailureStorm,
}

impl WsError {
    /// Renders the ending as a close frame, if one should be sent.
    #[instrument(level = "debug", skip_all)]
    pub(crate) fn into_close_frame(self) -> Option<CloseFrame> {
        tracing::debug!("{self:?}");
        match self {
            WsError::ConnectionClosed => {
                // nothing to do here
                None
            }
            WsError::Axum(axum_error) => {
                // try down casting if close-without-handshake
                let inner = axum_error.into_inner();
                if let Some(tungstenite::Error::Protocol(
                    ProtocolError::ResetWithoutClosingHandshake,
                )) = inner.downcast_ref()
                {
                    tracing::trace!("nothing to do client closed session (tungstenite error)");
                    None
                } else if let Some(io_err) = inner.downcast_ref::<std::io::Error>()
                    && io_err.kind() == ErrorKind::ConnectionReset
                {
                    tracing::trace!("nothing to do client closed session (Os error)");
                    None
                } else {
                    Some(CloseFrame {
                        code: close_code::ERROR,
                        reason: "unexpected error".into(),
                    })
                }
            }
            WsError::Cancelled => Some(CloseFrame {
                code: close_code::AWAY,
                reason: "connection closed by server".into(),
            }),
            WsError::IdleTimeout => Some(CloseFrame {
                code: close_codes::IDLE_TIMEOUT,
                reason: "no inbound frame within the liveness deadline".into(),
            }),
            WsError::TooManyDecodeFailures => Some(CloseFrame {
                code: close_codes::PROTOCOL_ERROR,
                reason: "too many undecodable frames".into(),
            }),
            WsError::FailureStorm => Some(CloseFrame {
                code: close_code::ERROR,
                reason: "too many failures, please reconnect".into(),
            }),
        }
    }
}
