//! Metrics definitions for the session proxy.
//!
//! This module defines all metrics keys used by the crate and provides a helper
//! [`describe_metrics`] to set metadata for each metric using the `metrics` crate.

/// Metrics key for the number of sessions currently registered.
pub const METRICS_ID_ACTIVE_SESSIONS: &str = "sessiongate.active_sessions";
/// Metrics key for the total number of requests proxied to an upstream Kubernetes API server,
/// labeled by `route` (the matched route pattern, not the session identifier) and `status`.
pub const METRICS_ID_KAS_PROXY_REQUESTS_TOTAL: &str = "sessiongate.kas_proxy_requests_total";
/// Metrics key for the duration of requests proxied to an upstream Kubernetes API server, labeled
/// by `route`.
pub const METRICS_ID_KAS_PROXY_REQUEST_DURATION: &str =
    "sessiongate.kas_proxy_requests_duration_seconds";

/// Describe all metrics used by the crate.
///
/// This calls the `describe_*` functions from the `metrics` crate to set metadata on the
/// different metrics. Call once at startup, before the first session is registered.
pub fn describe_metrics() {
    metrics::describe_gauge!(
        METRICS_ID_ACTIVE_SESSIONS,
        metrics::Unit::Count,
        "Number of sessions currently registered"
    );

    metrics::describe_counter!(
        METRICS_ID_KAS_PROXY_REQUESTS_TOTAL,
        metrics::Unit::Count,
        "Number of requests proxied to an upstream Kubernetes API server"
    );

    metrics::describe_histogram!(
        METRICS_ID_KAS_PROXY_REQUEST_DURATION,
        metrics::Unit::Seconds,
        "Duration of requests proxied to an upstream Kubernetes API server"
    );
}
