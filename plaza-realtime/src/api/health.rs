//! Readiness and version endpoints.
//!
//! - `/healthz` – `200 OK` once the background services report ready,
//!   `503 Service Unavailable` before that.
//! - `/version` – returns the crate name and version.
//!
//! The endpoints include a `Cache-Control: no-cache` header to prevent
//! caching of responses.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use axum::{
    Router,
    http::{HeaderValue, StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use tower_http::set_header::SetResponseHeaderLayer;

/// Create a router containing the health endpoints.
///
/// All endpoints have `Cache-Control: no-cache` set.
pub(crate) fn routes(started: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/healthz", get(move || health(started)))
        .route("/version", get(version))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
}

/// Responds `200 OK` once the reaper reported ready.
async fn health(started: Arc<AtomicBool>) -> impl IntoResponse {
    if started.load(Ordering::Relaxed) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

/// Responds with the cargo package name and version.
async fn version() -> impl IntoResponse {
    (
        StatusCode::OK,
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")),
    )
}
