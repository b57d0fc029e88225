//! The HTTP transport used by a [`crate::proxy::SessionProxy`] to reach its upstream.
//!
//! [`TrackingConnector`] is a `tower::Service<Uri>` that dials a raw TCP connection, hands it to a
//! [`ConnectionTracker`] *before* doing anything else with it, and only then layers TLS on top
//! with `tokio_rustls` if the target scheme is `https`. Tracking the pre-TLS stream means closing
//! it also tears down whatever TLS session was built on it.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tower::Service;

use crate::tracker::{ConnectionTracker, TrackedTcpStream};

/// A dialed connection to an upstream, tracked and (optionally) TLS-wrapped.
pub(crate) enum MaybeTlsStream {
    /// Plain TCP, for an `http` upstream.
    Plain(TrackedTcpStream),
    /// TLS over tracked TCP, for an `https` upstream.
    Tls(Box<TlsStream<TrackedTcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl Connection for MaybeTlsStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Errors while establishing a connection to the upstream.
#[derive(Debug, thiserror::Error)]
pub(crate) enum TransportError {
    /// The request URI carried no host.
    #[error("upstream URI has no host")]
    MissingHost,
    /// The request URI's host is not a valid TLS server name.
    #[error("invalid TLS server name: {0}")]
    InvalidServerName(#[from] rustls::pki_types::InvalidDnsNameError),
    /// The TCP dial failed.
    #[error("failed to connect to upstream: {0}")]
    Dial(#[source] io::Error),
    /// The TLS handshake failed.
    #[error("TLS handshake with upstream failed: {0}")]
    Tls(#[source] io::Error),
}

/// `tower::Service<Uri>` that dials, tracks, and (if needed) TLS-wraps a connection to an
/// upstream.
///
/// One instance is built per [`crate::proxy::SessionProxy`] and shared by the `hyper_util` legacy
/// client's connection pool for the lifetime of the session.
#[derive(Clone)]
pub(crate) struct TrackingConnector {
    tracker: ConnectionTracker,
    tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl TrackingConnector {
    /// Builds a connector that tracks every connection it dials through `tracker`, TLS-wrapping
    /// with `tls_config` when present.
    pub(crate) fn new(
        tracker: ConnectionTracker,
        tls_config: Option<Arc<rustls::ClientConfig>>,
    ) -> Self {
        Self {
            tracker,
            tls_config,
        }
    }
}

impl Service<Uri> for TrackingConnector {
    type Response = TokioIo<MaybeTlsStream>;
    type Error = TransportError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let tracker = self.tracker.clone();
        let tls_config = self.tls_config.clone();
        Box::pin(async move {
            let host = uri.host().ok_or(TransportError::MissingHost)?.to_string();
            let is_tls = tls_config.is_some();
            let port = uri
                .port_u16()
                .unwrap_or(if is_tls { 443 } else { 80 });

            let tcp = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(TransportError::Dial)?;
            let _ = tcp.set_nodelay(true);
            let tracked = tracker.wrap(tcp);

            let stream = match tls_config {
                Some(config) => {
                    let server_name = rustls::pki_types::ServerName::try_from(host)?.to_owned();
                    let connector = TlsConnector::from(config);
                    let tls_stream = connector
                        .connect(server_name, tracked)
                        .await
                        .map_err(TransportError::Tls)?;
                    MaybeTlsStream::Tls(Box::new(tls_stream))
                }
                None => MaybeTlsStream::Plain(tracked),
            };
            Ok(TokioIo::new(stream))
        })
    }
}
