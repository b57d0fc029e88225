//! API module for the session gate's front HTTP server.
//!
//! This module defines all HTTP endpoints the front server must serve and organizes them into
//! submodules:
//!
//! - [`health`] – Liveness and readiness endpoints (`/healthz`, `/readyz`).
//! - [`metrics`] – Prometheus metrics exposition (`/metrics`).
//! - [`dispatch`] – The session dispatch route (`/sessiongate/{session}/kas/{*rest}`).

pub(crate) mod dispatch;
pub(crate) mod health;
pub(crate) mod metrics;

use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use crate::registry::SessionRegistry;

/// Builds the complete front server router: session dispatch, health, and metrics endpoints, all
/// wrapped in an HTTP trace layer.
pub fn router(registry: SessionRegistry, prometheus_handle: PrometheusHandle) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(metrics::routes(prometheus_handle))
        .merge(dispatch::routes(registry))
        .layer(TraceLayer::new_for_http())
}
