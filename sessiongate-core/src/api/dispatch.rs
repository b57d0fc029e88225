//! The session dispatch route.
//!
//! Matches `/sessiongate/{session}/kas` and `/sessiongate/{session}/kas/{*rest}`, looks `session`
//! up in the [`SessionRegistry`], and hands the request to its [`crate::proxy::SessionProxy`] on a
//! hit. On a miss, responds `404 Not Found` with body `"Session not found"`.
//!
//! Wrapped in a [`MatchedPath`]-keyed metrics middleware recording request count and duration,
//! keyed by route pattern, never by the expanded session identifier, to keep metric cardinality
//! bounded.

use std::collections::HashMap;
use std::time::Instant;

use axum::extract::{MatchedPath, Path, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Router, middleware};
use http::StatusCode;
use tracing::instrument;

use crate::metrics::{METRICS_ID_KAS_PROXY_REQUEST_DURATION, METRICS_ID_KAS_PROXY_REQUESTS_TOTAL};
use crate::registry::SessionRegistry;
use crate::session_id::SessionIdentifier;

/// Create a router containing the session dispatch route.
pub(crate) fn routes(registry: SessionRegistry) -> Router {
    Router::new()
        .route("/sessiongate/{session}/kas", any(dispatch))
        .route("/sessiongate/{session}/kas/{*rest}", any(dispatch))
        .route_layer(middleware::from_fn(record_metrics))
        .with_state(registry)
}

#[instrument(level = "debug", skip_all, fields(session = tracing::field::Empty))]
async fn dispatch(
    State(registry): State<SessionRegistry>,
    Path(params): Path<HashMap<String, String>>,
    req: Request,
) -> Response {
    let Some(session) = params.get("session") else {
        return session_not_found();
    };
    let Ok(id) = SessionIdentifier::new(session.as_str()) else {
        return session_not_found();
    };
    tracing::Span::current().record("session", tracing::field::display(&id));
    match registry.lookup(&id) {
        Some(proxy) => proxy.serve(req).await,
        None => session_not_found(),
    }
}

fn session_not_found() -> Response {
    (StatusCode::NOT_FOUND, "Session not found").into_response()
}

/// Records request count and duration for the dispatch route, labeled by the matched route
/// pattern (e.g. `/sessiongate/{session}/kas/{*rest}`) rather than the expanded path.
async fn record_metrics(req: Request, next: middleware::Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());

    let start = Instant::now();
    let response = next.run(req).await;
    let status = response.status().as_u16().to_string();

    metrics::counter!(
        METRICS_ID_KAS_PROXY_REQUESTS_TOTAL,
        "route" => route.clone(),
        "status" => status,
    )
    .increment(1);
    metrics::histogram!(METRICS_ID_KAS_PROXY_REQUEST_DURATION, "route" => route)
        .record(start.elapsed().as_secs_f64());

    response
}
