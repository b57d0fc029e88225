//! The front HTTP server.
//!
//! Hand-rolls the accept loop on top of `hyper_util` instead of calling `axum::serve`: once a
//! request is hijacked for a protocol upgrade, any deadline on the underlying connection persists
//! past the upgrade and is never cleared by the upgrade-aware reverse proxy, which would kill
//! long-lived streams (watches, exec-like flows) with an I/O deadline error. `axum::serve` doesn't
//! expose `header_read_timeout`, so accepted connections here carry zero read/write deadlines and
//! only two explicit knobs: how long a client may take to send request headers, and how long an
//! idle keep-alive connection may sit unused.
//!
//! The idle timeout mirrors Go's `net/http.Server.IdleTimeout`: it only ever closes a connection
//! that is sitting between requests with no request currently being served. A request is "being
//! served" for as long as its response body is still being read by the client, so a silent,
//! non-upgraded, long-lived stream (a Kubernetes `watch=true` response that emits nothing for
//! minutes) never trips it, matching the read/write-deadline ban this module's timeout discipline
//! otherwise depends on.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use http::{Request, Response};
use http_body::{Body as HttpBody, Frame, SizeHint};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tower::Service as _;

use crate::config::CoreConfig;

/// Serves `app` on `listener` until `shutdown` is cancelled.
///
/// On shutdown, already in-flight requests get [`CoreConfig::graceful_shutdown_timeout`] to
/// finish before this function returns. Connections hijacked for a protocol upgrade are not
/// touched here: they are owned by their [`crate::proxy::SessionProxy`] and torn down through
/// [`crate::registry::SessionRegistry`] instead.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    config: &CoreConfig,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let mut conn_builder = ConnBuilder::new(TokioExecutor::new());
    conn_builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(config.read_header_timeout);
    let conn_builder = conn_builder;

    let graceful = GracefulShutdown::new();
    let idle_timeout = config.idle_timeout;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (socket, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to accept connection");
                        continue;
                    }
                };
                tracing::debug!(%peer_addr, "accepted connection");

                let tower_service = app.clone();
                let activity = Arc::new(ActivityTracker::new());
                let tracked = TrackedIo {
                    inner: socket,
                    activity: activity.clone(),
                };
                let io = TokioIo::new(tracked);

                let hyper_service = hyper::service::service_fn(move |request: Request<Incoming>| {
                    let mut tower_service = tower_service.clone();
                    let activity = activity.clone();
                    async move {
                        activity.begin_request();
                        let guard = InFlightGuard(activity);
                        let response = tower_service.call(request.map(Body::new)).await?;
                        let (parts, body) = response.into_parts();
                        let body = Body::new(GuardedBody { inner: body, _guard: guard });
                        Ok::<_, std::convert::Infallible>(Response::from_parts(parts, body))
                    }
                });

                let conn = conn_builder.serve_connection_with_upgrades(io, hyper_service);
                let conn = graceful.watch(conn);

                tokio::spawn(async move {
                    tokio::select! {
                        result = conn => {
                            if let Err(err) = result {
                                tracing::debug!(%peer_addr, error = %err, "connection ended with error");
                            }
                        }
                        () = idle_watchdog(activity, idle_timeout), if !idle_timeout.is_zero() => {
                            tracing::debug!(%peer_addr, "closing connection after idle timeout");
                        }
                    }
                });
            }
        }
    }

    tracing::info!("shutdown signal received, draining in-flight requests");
    tokio::select! {
        () = graceful.shutdown() => {
            tracing::info!("all connections drained before the graceful shutdown timeout");
        }
        () = tokio::time::sleep(config.graceful_shutdown_timeout) => {
            tracing::warn!("graceful shutdown timeout elapsed with connections still open");
        }
    }

    Ok(())
}

/// Tracks the last time a byte was read or written on a connection, relative to its own creation,
/// and how many requests on that connection currently have a response in flight.
struct ActivityTracker {
    start: Instant,
    last_activity_millis: AtomicU64,
    requests_in_flight: AtomicUsize,
}

impl ActivityTracker {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_activity_millis: AtomicU64::new(0),
            requests_in_flight: AtomicUsize::new(0),
        }
    }

    fn touch(&self) {
        self.last_activity_millis
            .store(self.start.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Marks one request as dispatched. Paired with [`ActivityTracker::end_request`], called once
    /// the response (including its body) has been fully delivered or abandoned.
    fn begin_request(&self) {
        self.requests_in_flight.fetch_add(1, Ordering::SeqCst);
    }

    fn end_request(&self) {
        self.requests_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.touch();
    }

    /// How long this connection has had no request in flight and no read/write activity.
    ///
    /// While a request is in flight, this is always zero: the idle timeout only ever applies to a
    /// connection sitting between requests, never to one actively serving a (possibly silent,
    /// long-lived) response.
    fn idle_for(&self) -> Duration {
        if self.requests_in_flight.load(Ordering::SeqCst) > 0 {
            return Duration::ZERO;
        }
        let now = self.start.elapsed().as_millis() as u64;
        let last = self.last_activity_millis.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }
}

/// Decrements [`ActivityTracker::requests_in_flight`] when dropped, however the request this
/// guard belongs to ends: a fully streamed response body, a client disconnect, or a panic.
struct InFlightGuard(Arc<ActivityTracker>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.end_request();
    }
}

/// Wraps a response body so the connection it belongs to is only considered idle-between-requests
/// once the body itself (not just the response head) is fully delivered or dropped.
struct GuardedBody {
    inner: Body,
    _guard: InFlightGuard,
}

impl HttpBody for GuardedBody {
    type Data = axum::body::Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Sleeps until `activity` reports no in-flight request and no read/write for `idle_timeout`.
///
/// Only ever raced against a connection's own serving future: once that future resolves (cleanly,
/// or because it handed the connection off for a protocol upgrade), this watchdog is dropped and
/// imposes no further deadline.
async fn idle_watchdog(activity: Arc<ActivityTracker>, idle_timeout: Duration) {
    loop {
        let remaining = idle_timeout.saturating_sub(activity.idle_for());
        if remaining.is_zero() {
            return;
        }
        tokio::time::sleep(remaining).await;
    }
}

/// Wraps a [`TcpStream`], recording activity on every successful read or write.
struct TrackedIo {
    inner: TcpStream,
    activity: Arc<ActivityTracker>,
}

impl AsyncRead for TrackedIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if result.is_ready() && buf.filled().len() > before {
            self.activity.touch();
        }
        result
    }
}

impl AsyncWrite for TrackedIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if matches!(result, Poll::Ready(Ok(n)) if n > 0) {
            self.activity.touch();
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
