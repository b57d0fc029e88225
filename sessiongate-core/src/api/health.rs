//! Health Check Endpoints
//!
//! - `/healthz` – liveness: the process is up.
//! - `/readyz` – readiness: the process can serve traffic.
//!
//! The front server distinguishes neither from the other: both return `200 OK` unconditionally.
//! Liveness and readiness are distinguished by the orchestrator, not by this crate.
//!
//! Responses carry `Cache-Control: no-cache` to prevent caching.

use axum::{
    Router,
    http::{HeaderValue, header},
    routing::get,
};
use tower_http::set_header::SetResponseHeaderLayer;

/// Create a router containing the health endpoints.
pub(crate) fn routes() -> Router {
    Router::new()
        .route("/healthz", get(ok))
        .route("/readyz", get(ok))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
}

async fn ok() {}
