//! [`SessionProxy`]: the upgrade-aware reverse proxy for one active session.

use std::sync::atomic::{AtomicBool, Ordering};

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use http::{HeaderName, HeaderValue, Request, StatusCode, Uri, header};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::session_id::SessionIdentifier;
use crate::tracker::ConnectionTracker;
use crate::transport::TrackingConnector;
use crate::upstream::{Credentials, UpstreamClientConfig, UpstreamConfigError};

/// Failure while constructing a [`SessionProxy`] from an [`UpstreamClientConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ProxyConstructionError {
    /// The upstream configuration's URL or TLS material could not be interpreted.
    #[error(transparent)]
    Upstream(#[from] UpstreamConfigError),
}

/// The reverse proxy serving one active session.
///
/// Constructed once by [`crate::registry::SessionRegistry::register`] and shared by every request
/// for that session until [`SessionProxy::close`] is invoked.
pub struct SessionProxy {
    id: SessionIdentifier,
    strip_prefix: String,
    upstream_base: Url,
    credentials: Credentials,
    client: Client<TrackingConnector, Body>,
    tracker: ConnectionTracker,
    session_ctx: CancellationToken,
    closed: AtomicBool,
}

impl SessionProxy {
    /// Builds a new proxy for `id`, talking to `upstream`.
    ///
    /// `parent` is the cancellation token whose child becomes this session's context; cancelling
    /// `parent` (directly, or via [`SessionProxy::close`]) cancels every in-flight request for
    /// this session.
    pub(crate) fn new(
        id: SessionIdentifier,
        upstream: UpstreamClientConfig,
        parent: CancellationToken,
    ) -> Result<Self, ProxyConstructionError> {
        let tls_config = upstream.tls_client_config()?;
        let tracker = ConnectionTracker::default();
        let connector = TrackingConnector::new(tracker.clone(), tls_config);
        let client = Client::builder(TokioExecutor::new()).build(connector);
        let strip_prefix = format!("/sessiongate/{id}/kas");

        Ok(Self {
            id,
            strip_prefix,
            upstream_base: upstream.base_url,
            credentials: upstream.credentials,
            client,
            tracker,
            session_ctx: parent,
            closed: AtomicBool::new(false),
        })
    }

    /// Serves one request for this session.
    ///
    /// Returns `404 Not Found` if the request path does not carry this session's strip prefix
    /// (the front server's routing already guarantees this does not happen), `502 Bad Gateway` on
    /// any upstream failure, and otherwise the (possibly streamed or upgraded) upstream response.
    #[tracing::instrument(level = "debug", skip_all, fields(session = %self.id))]
    pub async fn serve(&self, req: Request<Body>) -> Response {
        if self.closed.load(Ordering::SeqCst) {
            return bad_gateway(&self.id, "session is closed");
        }

        let Some(rest) = strip_session_prefix(req.uri().path(), &self.strip_prefix) else {
            return session_not_found();
        };

        let request_ctx = self.session_ctx.child_token();
        let upgrade = wants_upgrade(&req);

        tokio::select! {
            _ = request_ctx.cancelled() => {
                bad_gateway(&self.id, "session closed while request was in flight")
            }
            response = self.proxy_once(req, rest, upgrade) => response,
        }
    }

    async fn proxy_once(&self, req: Request<Body>, rest: String, upgrade: bool) -> Response {
        if upgrade {
            self.proxy_upgrade(req, &rest).await
        } else {
            self.proxy_simple(req, &rest).await
        }
    }

    /// Standard single-hop reverse proxy: forward method/headers/body, stream the response
    /// without buffering, never follow redirects (the underlying client doesn't either).
    async fn proxy_simple(&self, req: Request<Body>, rest: &str) -> Response {
        let outbound = match self.build_outbound_request(req, rest, false) {
            Ok(req) => req,
            Err(err) => return bad_gateway(&self.id, err),
        };

        match self.client.request(outbound).await {
            Ok(resp) => {
                let (mut parts, body) = resp.into_parts();
                strip_hop_by_hop(&mut parts.headers, false);
                Response::from_parts(parts, Body::new(body))
            }
            Err(err) => bad_gateway(&self.id, err),
        }
    }

    /// Performs the upstream handshake for an `Upgrade` request (notably WebSocket), then splices
    /// the client and upstream connections bidirectionally until either side closes.
    async fn proxy_upgrade(&self, mut req: Request<Body>, rest: &str) -> Response {
        let client_upgrade = hyper::upgrade::on(&mut req);

        let outbound = match self.build_outbound_request(req, rest, true) {
            Ok(req) => req,
            Err(err) => return bad_gateway(&self.id, err),
        };

        let mut upstream_resp = match self.client.request(outbound).await {
            Ok(resp) => resp,
            Err(err) => return bad_gateway(&self.id, err),
        };

        if upstream_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
            let (mut parts, body) = upstream_resp.into_parts();
            strip_hop_by_hop(&mut parts.headers, false);
            return Response::from_parts(parts, Body::new(body));
        }

        let upstream_upgrade = hyper::upgrade::on(&mut upstream_resp);
        let id = self.id.clone();
        let session_ctx = self.session_ctx.clone();

        tokio::spawn(async move {
            let (client_io, upstream_io) = match tokio::try_join!(client_upgrade, upstream_upgrade)
            {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(session = %id, error = %err, "upgrade handshake did not complete");
                    return;
                }
            };
            let mut client_io = TokioIo::new(client_io);
            let mut upstream_io = TokioIo::new(upstream_io);

            tokio::select! {
                result = tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io) => {
                    if let Err(err) = result {
                        tracing::debug!(session = %id, error = %err, "spliced connection ended");
                    }
                }
                _ = session_ctx.cancelled() => {
                    tracing::debug!(session = %id, "session closed, tearing down spliced connection");
                }
            }
        });

        let (mut parts, body) = upstream_resp.into_parts();
        strip_hop_by_hop(&mut parts.headers, true);
        Response::from_parts(parts, Body::new(body))
    }

    fn build_outbound_request(
        &self,
        req: Request<Body>,
        rest: &str,
        keep_upgrade: bool,
    ) -> Result<Request<Body>, http::Error> {
        let (mut parts, body) = req.into_parts();
        strip_hop_by_hop(&mut parts.headers, keep_upgrade);

        if let Credentials::BearerToken(token) = &self.credentials {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .unwrap_or_else(|_| HeaderValue::from_static("Bearer invalid"));
            parts.headers.insert(header::AUTHORIZATION, value);
        }

        let upstream_path = format!("{}{rest}", self.upstream_base.path());
        let path_and_query = match parts.uri.query() {
            Some(query) => format!("{upstream_path}?{query}"),
            None => upstream_path,
        };
        let authority = format!(
            "{}{}",
            self.upstream_base.host_str().unwrap_or_default(),
            self.upstream_base
                .port()
                .map(|port| format!(":{port}"))
                .unwrap_or_default(),
        );
        let uri = Uri::builder()
            .scheme(self.upstream_base.scheme())
            .authority(authority)
            .path_and_query(path_and_query)
            .build()?;

        parts.uri = uri;
        parts.version = http::Version::HTTP_11;
        Ok(Request::from_parts(parts, body))
    }

    /// Idempotently tears this proxy down.
    ///
    /// Cancels the session context first (unblocking or aborting every in-flight request,
    /// including indefinitely streaming watches), then force-closes every tracked upstream
    /// connection. Safe to call more than once and from multiple tasks concurrently; only the
    /// first call has any effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.session_ctx.cancel();
        let report = self.tracker.close_all();
        for err in report.errors {
            tracing::warn!(session = %self.id, error = %err, "error while force-closing an upstream connection");
        }
    }
}

impl Drop for SessionProxy {
    fn drop(&mut self) {
        self.close();
    }
}

fn strip_session_prefix(path: &str, prefix: &str) -> Option<String> {
    if path == prefix {
        Some(String::new())
    } else {
        path.strip_prefix(prefix)
            .filter(|rest| rest.starts_with('/'))
            .map(str::to_string)
    }
}

/// Whether `req` is a WebSocket upgrade request.
///
/// Only `Upgrade: websocket` (case-insensitive) takes the splicing path; any other upgrade
/// protocol, notably `SPDY/3.1` (which older Kubernetes `exec`/`attach`/`port-forward` paths use),
/// falls through to [`SessionProxy::proxy_simple`] instead. SPDY is an explicit non-goal;
/// forwarding it as a plain request lets the upstream reject it cleanly rather than this proxy
/// silently mishandling a protocol it doesn't speak.
fn wants_upgrade(req: &Request<Body>) -> bool {
    let has_upgrade_token = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains("upgrade"));
    let is_websocket = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"));
    has_upgrade_token && is_websocket
}

fn strip_hop_by_hop(headers: &mut http::HeaderMap, keep_upgrade: bool) {
    headers.remove(header::PROXY_AUTHENTICATE);
    headers.remove(header::PROXY_AUTHORIZATION);
    headers.remove(header::TE);
    headers.remove(header::TRAILER);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(HeaderName::from_static("keep-alive"));
    if !keep_upgrade {
        headers.remove(header::CONNECTION);
        headers.remove(header::UPGRADE);
    }
}

fn session_not_found() -> Response {
    (StatusCode::NOT_FOUND, "Session not found").into_response()
}

fn bad_gateway(id: &SessionIdentifier, detail: impl std::fmt::Display) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        format!("Bad gateway for session {id}: {detail}"),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_session_prefix_handles_empty_rest() {
        assert_eq!(
            strip_session_prefix("/sessiongate/s1/kas", "/sessiongate/s1/kas"),
            Some(String::new())
        );
    }

    #[test]
    fn strip_session_prefix_handles_nested_path() {
        assert_eq!(
            strip_session_prefix(
                "/sessiongate/s1/kas/api/v1/namespaces",
                "/sessiongate/s1/kas"
            ),
            Some("/api/v1/namespaces".to_string())
        );
    }

    #[test]
    fn strip_session_prefix_rejects_sibling_path() {
        assert_eq!(
            strip_session_prefix("/sessiongate/s1/kasbah", "/sessiongate/s1/kas"),
            None
        );
    }

    #[test]
    fn strip_session_prefix_rejects_unrelated_path() {
        assert_eq!(
            strip_session_prefix("/sessiongate/s2/kas/x", "/sessiongate/s1/kas"),
            None
        );
    }

    fn upgrade_request(upgrade: &str) -> Request<Body> {
        Request::builder()
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, upgrade)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn wants_upgrade_accepts_websocket_case_insensitively() {
        assert!(wants_upgrade(&upgrade_request("websocket")));
        assert!(wants_upgrade(&upgrade_request("WebSocket")));
    }

    #[test]
    fn wants_upgrade_rejects_spdy() {
        assert!(!wants_upgrade(&upgrade_request("SPDY/3.1")));
    }

    #[test]
    fn wants_upgrade_rejects_other_protocols() {
        assert!(!wants_upgrade(&upgrade_request("h2c")));
    }

    #[test]
    fn wants_upgrade_requires_the_upgrade_header() {
        let req = Request::builder()
            .header(header::CONNECTION, "Upgrade")
            .body(Body::empty())
            .unwrap();
        assert!(!wants_upgrade(&req));
    }

    #[test]
    fn wants_upgrade_requires_the_connection_token() {
        let req = Request::builder()
            .header(header::UPGRADE, "websocket")
            .body(Body::empty())
            .unwrap();
        assert!(!wants_upgrade(&req));
    }
}
