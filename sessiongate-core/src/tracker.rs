//! Connection Tracker: wraps every outbound upstream connection and supports bulk-closing all of
//! them.
//!
//! The tracked unit is the raw, pre-TLS [`tokio::net::TcpStream`] produced by the dialer, the
//! same point at which Go's `net.Conn` is wrapped by a `DialContext` hook. TLS, when used, is
//! layered on top of the tracked stream by [`crate::transport`], so closing the tracked stream
//! also tears down whatever TLS session was built on it.
//!
//! Forcing a close from a task other than the one currently reading/writing the connection is
//! done with a raw `shutdown(2)` on a duplicated file descriptor: the kernel unblocks any
//! concurrently blocked read or write on that socket immediately, the same way a Go goroutine's
//! blocked `Read` unblocks when another goroutine calls `Conn.Close`. This needs no cooperation
//! from the task actually driving the connection.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

#[cfg(unix)]
use std::os::fd::{AsRawFd, FromRawFd};

/// A set of live upstream connections, with a bulk-close operation.
///
/// Thread-safe under concurrent [`ConnectionTracker::wrap`] and
/// [`ConnectionTracker::close_all`]; safe to call from as many tasks as needed at once.
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, CloseHandle>>,
}

/// A way to forcibly abort one tracked connection from outside the task using it.
///
/// Holds a `dup(2)`-ed file descriptor rather than the original one. Without the duplicate, a
/// handle stored in the live set would be a bare integer that outlives the `TrackedTcpStream` it
/// was taken from: if that stream closes naturally (Drop, or `poll_shutdown`) in the window
/// between `close_all`'s snapshot and its call to `abort`, the kernel is free to recycle the same
/// fd number for an unrelated socket opened concurrently elsewhere in the process, and `abort`
/// would shut that unrelated socket down instead. A `dup`'d descriptor keeps referring to the same
/// open file description regardless of what happens to the original fd number, so this handle
/// always targets the right socket, or, once the original side has already closed, is a harmless
/// no-op on its own dangling duplicate.
struct CloseHandle {
    #[cfg(unix)]
    socket: socket2::Socket,
}

impl CloseHandle {
    #[cfg(unix)]
    fn from_tcp_stream(stream: &TcpStream) -> io::Result<Self> {
        // SAFETY: `fd` is a file descriptor borrowed from a live `TcpStream` owned elsewhere.
        // `from_raw_fd` followed immediately by `try_clone` (a `dup(2)`) gives us an independently
        // owned descriptor; `mem::forget`-ing the temporary wrapper prevents its `Drop` from
        // closing a descriptor this function does not own.
        let borrowed = unsafe { socket2::Socket::from_raw_fd(stream.as_raw_fd()) };
        let cloned = borrowed.try_clone();
        std::mem::forget(borrowed);
        Ok(Self { socket: cloned? })
    }

    #[cfg(not(unix))]
    fn from_tcp_stream(_stream: &TcpStream) -> io::Result<Self> {
        Ok(Self {})
    }

    /// Shuts down both directions of the socket. Safe to call while another task is concurrently
    /// blocked on a read or write of the same socket: that call returns promptly with an error or
    /// EOF instead of hanging.
    #[cfg(unix)]
    fn abort(&self) -> io::Result<()> {
        self.socket.shutdown(std::net::Shutdown::Both)
    }

    #[cfg(not(unix))]
    fn abort(&self) -> io::Result<()> {
        Err(io::Error::other(
            "forced connection abort is only supported on unix targets",
        ))
    }
}

/// Aggregated result of [`ConnectionTracker::close_all`]: never fails the caller, but records
/// per-connection close errors for logging.
#[derive(Debug, Default)]
pub struct CloseAllReport {
    /// Number of connections that were tracked at snapshot time.
    pub closed: usize,
    /// Per-connection errors encountered while aborting. Never includes "connection already
    /// closed" style errors as failures: those are expected when a connection died on its own
    /// between snapshot and abort.
    pub errors: Vec<io::Error>,
}

impl ConnectionTracker {
    /// Wraps a freshly dialed TCP connection, inserting it into the live set before returning it.
    ///
    /// The returned [`TrackedTcpStream`] removes itself from the tracker on its first close,
    /// whether that close is driven by the proxy code using it, by the remote peer, or by
    /// [`ConnectionTracker::close_all`].
    pub fn wrap(&self, conn: TcpStream) -> TrackedTcpStream {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        match CloseHandle::from_tcp_stream(&conn) {
            Ok(handle) => {
                self.inner.live.lock().insert(id, handle);
            }
            Err(error) => {
                tracing::warn!(
                    %error,
                    "failed to duplicate connection file descriptor; this connection will not be forcibly closable"
                );
            }
        }
        TrackedTcpStream {
            id,
            inner: conn,
            tracker: self.inner.clone(),
            deregistered: false,
        }
    }

    /// Snapshots the current live set and aborts every connection in it.
    ///
    /// Idempotent and safe to call concurrently with [`ConnectionTracker::wrap`] and with
    /// connections closing on their own: new connections registered after the snapshot is taken
    /// are left untouched (they are the caller's policy to close, per the contract), and
    /// connections that raced a natural close are simply absent from the snapshot or return a
    /// "not connected" style error that is not surfaced as a failure.
    pub fn close_all(&self) -> CloseAllReport {
        let snapshot: Vec<(u64, CloseHandle)> = {
            let mut live = self.inner.live.lock();
            std::mem::take(&mut *live).into_iter().collect()
        };
        let mut report = CloseAllReport {
            closed: snapshot.len(),
            errors: Vec::new(),
        };
        for (_, handle) in snapshot {
            if let Err(err) = handle.abort()
                && err.kind() != io::ErrorKind::NotConnected
            {
                report.errors.push(err);
            }
        }
        report
    }

    /// Current number of live tracked connections. For tests and diagnostics only.
    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.live.lock().len()
    }
}

/// A TCP connection tracked by a [`ConnectionTracker`].
///
/// Implements [`AsyncRead`]/[`AsyncWrite`] by delegating to the wrapped stream, so it is a
/// drop-in replacement for `TcpStream` anywhere an instrumented dial result is needed.
pub struct TrackedTcpStream {
    id: u64,
    inner: TcpStream,
    tracker: Arc<Inner>,
    deregistered: bool,
}

impl TrackedTcpStream {
    fn deregister(&mut self) {
        if !self.deregistered {
            self.tracker.live.lock().remove(&self.id);
            self.deregistered = true;
        }
    }

    /// Direct access to the wrapped stream, e.g. to perform a TLS handshake on top of it.
    pub fn get_ref(&self) -> &TcpStream {
        &self.inner
    }
}

impl Drop for TrackedTcpStream {
    fn drop(&mut self) {
        self.deregister();
    }
}

impl AsyncRead for TrackedTcpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedTcpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = Pin::new(&mut self.inner).poll_shutdown(cx);
        if result.is_ready() {
            self.deregister();
        }
        result
    }
}
