//! The `/ws` upgrade endpoint and the per-connection loops.
//!
//! Authentication happens before the upgrade: the bearer token of the
//! `Authorization` header is the session id, which must reference a live
//! session in the presence store (401 otherwise). Clients also announce
//! their protocol version in a header; a version outside the accepted range
//! is rejected with `426 Upgrade Required`, as is a plain GET without an
//! upgrade.
//!
//! After the upgrade every connection owns two tasks: the reader decodes
//! frames and hands them to the router, the writer drains the bounded
//! outbound queue under a per-frame deadline. The bounded queue between hub
//! and writer is both the backpressure boundary (overflow ⇒ stalled peer ⇒
//! close) and the natural cancellation point.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::close_code;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::response::IntoResponse;
use axum::{
    Router,
    extract::{
        WebSocketUpgrade,
        ws::{self, CloseFrame, WebSocket},
    },
    routing::any,
};
use axum_extra::headers::Header;
use axum_extra::headers::authorization::{Authorization, Bearer};
use axum_extra::typed_header::TypedHeaderRejection;
use axum_extra::{TypedHeader, headers};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use http::{HeaderValue, StatusCode};
use plaza_types::api::v1::{ClientFrame, ErrorFrame, ServerEvent, error_codes};
use plaza_types::{Session, SessionId};
use semver::VersionReq;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, instrument};

use crate::api::errors::WsError;
use crate::metrics::METRICS_ID_NODE_FRAMES_DECODE_ERROR;
use crate::services::hub::{ConnectionHub, OutboundFrame};
use crate::services::presence::{PresenceError, PresenceService, PresenceStore as _};
use crate::services::router::{ConnectionContext, MessageRouter};

/// Consecutive decode failures tolerated before the connection is closed.
const MAX_DECODE_FAILURES: u32 = 3;
/// Infrastructure failures tolerated within [`INFRA_FAILURE_WINDOW`].
const MAX_INFRA_FAILURES: usize = 5;
/// The sliding window for the infra failure storm threshold.
const INFRA_FAILURE_WINDOW: Duration = Duration::from_secs(30);

/// A custom header that clients send to announce their protocol version.
#[derive(Debug, Clone)]
pub(crate) struct ProtocolVersion(semver::Version);

impl Header for ProtocolVersion {
    fn name() -> &'static http::HeaderName {
        &plaza_types::api::PLAZA_PROTOCOL_VERSION_HEADER
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, axum_extra::headers::Error>
    where
        Self: Sized,
        I: Iterator<Item = &'i http::HeaderValue>,
    {
        let value = values
            .next()
            .ok_or_else(headers::Error::invalid)?
            .to_str()
            .map_err(|err| {
                tracing::trace!("could not convert header to string: {err:?}");
                headers::Error::invalid()
            })?;
        if values.next().is_some() {
            Err(headers::Error::invalid())
        } else {
            let version = semver::Version::parse(value).map_err(|err| {
                tracing::trace!("could not parse header version: {err:?}");
                headers::Error::invalid()
            })?;
            Ok(ProtocolVersion(version))
        }
    }

    fn encode<E: Extend<http::HeaderValue>>(&self, values: &mut E) {
        let encoded = HeaderValue::from_bytes(self.0.to_string().as_bytes())
            .expect("Cannot encode header version");
        values.extend(std::iter::once(encoded));
    }
}

/// Everything the upgrade endpoint needs.
pub(crate) struct WsArgs {
    pub(crate) router: MessageRouter,
    pub(crate) hub: ConnectionHub,
    pub(crate) presence: PresenceService,
    pub(crate) version_req: VersionReq,
    pub(crate) max_message_size: usize,
    pub(crate) write_timeout: Duration,
    pub(crate) liveness_deadline: Duration,
}

/// Creates a `Router` with the single `/ws` route.
///
/// The clients upgrade their connection via the websocket upgrade protocol.
/// Axum supports both HTTP/1.1 and HTTP/2.0 websocket connections,
/// therefore we accept connections with `any`.
pub(crate) fn routes(args: WsArgs) -> Router {
    let args = Arc::new(args);
    Router::new().route(
        "/ws",
        any(move |auth, version, websocket_upgrade| {
            upgrade(Arc::clone(&args), auth, version, websocket_upgrade)
        }),
    )
}

/// Pre-upgrade validation, then the socket handoff.
///
/// Rejections follow the upgrade contract: 401 for a missing or unknown
/// session bearer, 426 for an unsupported (or missing) protocol version and
/// for plain GETs that never asked for an upgrade.
#[instrument(level = "debug", skip_all, name = "ws_upgrade")]
async fn upgrade(
    args: Arc<WsArgs>,
    auth: Result<TypedHeader<Authorization<Bearer>>, TypedHeaderRejection>,
    version: Result<TypedHeader<ProtocolVersion>, TypedHeaderRejection>,
    websocket_upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> axum::response::Response {
    let Ok(TypedHeader(Authorization(bearer))) = auth else {
        return (StatusCode::UNAUTHORIZED, "missing bearer session id").into_response();
    };
    let Some(session_id) = SessionId::parse(bearer.token()) else {
        return (StatusCode::UNAUTHORIZED, "malformed session id").into_response();
    };
    let Ok(TypedHeader(ProtocolVersion(client_version))) = version else {
        return (
            StatusCode::UPGRADE_REQUIRED,
            format!("missing protocol version, expected: {}", args.version_req),
        )
            .into_response();
    };
    tracing::trace!("checking version header: {client_version}");
    if !args.version_req.matches(&client_version) {
        tracing::trace!("rejecting because version mismatch");
        return (
            StatusCode::UPGRADE_REQUIRED,
            format!("invalid version, expected: {}", args.version_req),
        )
            .into_response();
    }
    let session = match args.presence.get(session_id).await {
        Ok(session) => session,
        Err(PresenceError::NotFound(_)) => {
            return (StatusCode::UNAUTHORIZED, "unknown session").into_response();
        }
        Err(PresenceError::Store(err)) => {
            tracing::error!("presence lookup during upgrade failed: {err:?}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "presence unavailable").into_response();
        }
    };
    let Ok(websocket_upgrade) = websocket_upgrade else {
        return (StatusCode::UPGRADE_REQUIRED, "websocket upgrade required").into_response();
    };

    let parent_span = tracing::Span::current();
    websocket_upgrade
        .max_message_size(args.max_message_size)
        .on_failed_upgrade(|err| {
            tracing::warn!("could not establish websocket connection: {err:?}");
        })
        .on_upgrade(move |socket| {
            handle_socket(socket, session, args).instrument(parent_span)
        })
}

/// The whole life-cycle of one connection.
#[instrument(level = "debug", skip_all, fields(session_id = %session.id, map_id = %session.map_id))]
async fn handle_socket(socket: WebSocket, session: Session, args: Arc<WsArgs>) {
    let registration = match args.hub.register(&session) {
        Ok(registration) => registration,
        Err(err) => {
            tracing::debug!("rejecting socket: {err}");
            let mut socket = socket;
            let _ = socket
                .send(ws::Message::Close(Some(CloseFrame {
                    code: close_code::AGAIN,
                    reason: "not accepting connections".into(),
                })))
                .await;
            return;
        }
    };
    let ctx = ConnectionContext::from_session(&session);
    let cancel = registration.cancel.clone();
    let (sink, mut stream) = socket.split();
    let writer = args.hub.track(write_loop(
        sink,
        registration.outbound,
        args.write_timeout,
        cancel.clone(),
    ));

    let ending = read_loop(&mut stream, &ctx, &args, &cancel).await;

    args.hub.unregister(registration.conn_id).await;
    cancel.cancel();
    let Ok(sink) = writer.await else {
        return;
    };
    if let Some(close_frame) = ending.into_close_frame() {
        tracing::trace!(" < sending close frame");
        // axum's own example just sends the frame and ignores the error
        // without waiting for the peer's close frame, so we do the same
        if let Ok(mut socket) = sink.reunite(stream) {
            let _ = socket.send(ws::Message::Close(Some(close_frame))).await;
        }
    }
}

/// Reads, decodes and routes inbound frames until the connection ends.
async fn read_loop(
    stream: &mut SplitStream<WebSocket>,
    ctx: &ConnectionContext,
    args: &WsArgs,
    cancel: &CancellationToken,
) -> WsError {
    let mut decode_failures = 0u32;
    let mut infra_failures: VecDeque<Instant> = VecDeque::new();
    let mut deadline = tokio::time::Instant::now() + args.liveness_deadline;
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return WsError::Cancelled,
            _ = tokio::time::sleep_until(deadline) => return WsError::IdleTimeout,
            msg = stream.next() => msg,
        };
        let msg = match msg {
            None => return WsError::ConnectionClosed,
            Some(Err(err)) => return WsError::Axum(err),
            Some(Ok(msg)) => msg,
        };
        // any inbound frame counts as liveness
        deadline = tokio::time::Instant::now() + args.liveness_deadline;

        let text = match msg {
            ws::Message::Text(text) => text,
            ws::Message::Close(_) => return WsError::ConnectionClosed,
            ws::Message::Ping(_) | ws::Message::Pong(_) => continue,
            ws::Message::Binary(_) => {
                if let Some(ending) = report_decode_failure(
                    ctx,
                    args,
                    &mut decode_failures,
                    "expected a JSON text frame",
                ) {
                    return ending;
                }
                continue;
            }
        };

        let frame = match serde_json::from_str::<ClientFrame>(text.as_str()) {
            Ok(frame) => frame,
            Err(err) => {
                if let Some(ending) =
                    report_decode_failure(ctx, args, &mut decode_failures, &err.to_string())
                {
                    return ending;
                }
                continue;
            }
        };
        decode_failures = 0;

        if let Err(err) = args.router.handle_frame(ctx, frame).await {
            if err.is_infra() {
                let now = Instant::now();
                infra_failures.push_back(now);
                while infra_failures
                    .front()
                    .is_some_and(|at| now.duration_since(*at) > INFRA_FAILURE_WINDOW)
                {
                    infra_failures.pop_front();
                }
                if infra_failures.len() >= MAX_INFRA_FAILURES {
                    return WsError::FailureStorm;
                }
            }
            args.hub
                .send_to_session(ctx.session_id, ServerEvent::Error(err.error_frame()));
        }
    }
}

/// Sends an `INVALID_MESSAGE` error and decides whether to give up on the
/// connection.
fn report_decode_failure(
    ctx: &ConnectionContext,
    args: &WsArgs,
    decode_failures: &mut u32,
    detail: &str,
) -> Option<WsError> {
    ::metrics::counter!(METRICS_ID_NODE_FRAMES_DECODE_ERROR).increment(1);
    *decode_failures += 1;
    args.hub.send_to_session(
        ctx.session_id,
        ServerEvent::Error(ErrorFrame::new(error_codes::INVALID_MESSAGE, detail)),
    );
    if *decode_failures >= MAX_DECODE_FAILURES {
        Some(WsError::TooManyDecodeFailures)
    } else {
        None
    }
}

/// Drains the outbound queue onto the socket under a per-frame deadline.
///
/// Returns the sink so the caller can reunite the socket for the closing
/// handshake. On cancellation the frames already queued are flushed within
/// the same deadline regime; a missed deadline abandons the connection.
async fn write_loop(
    mut sink: SplitSink<WebSocket, ws::Message>,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    write_timeout: Duration,
    cancel: CancellationToken,
) -> SplitSink<WebSocket, ws::Message> {
    let mut healthy = true;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if !write_frame(&mut sink, &frame, write_timeout, &cancel).await {
            healthy = false;
            break;
        }
    }
    if healthy {
        // bounded drain of whatever was already queued
        while let Ok(frame) = outbound.try_recv() {
            if !write_frame(&mut sink, &frame, write_timeout, &cancel).await {
                break;
            }
        }
    }
    sink
}

async fn write_frame(
    sink: &mut SplitSink<WebSocket, ws::Message>,
    frame: &OutboundFrame,
    write_timeout: Duration,
    cancel: &CancellationToken,
) -> bool {
    match tokio::time::timeout(write_timeout, sink.send(ws::Message::text(frame.as_ref()))).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            tracing::debug!("write failed: {err:?}");
            cancel.cancel();
            false
        }
        Err(_) => {
            tracing::warn!("write deadline of {write_timeout:?} missed, closing");
            ::metrics::counter!(crate::metrics::METRICS_ID_NODE_CONNECTIONS_STALLED).increment(1);
            cancel.cancel();
            false
        }
    }
}
