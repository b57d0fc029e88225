#![deny(missing_docs)]
//! Core engine of the session gate: a multi-tenant, time-limited reverse proxy in front of
//! Kubernetes API servers.
//!
//! An external control plane mints a short-lived debugging session against some upstream
//! Kubernetes API server, then calls [`registry::SessionRegistry::register`] with a
//! [`upstream::UpstreamClientConfig`] describing how to reach it. Registration returns a public
//! endpoint of the form `{ingressBaseURL}/sessiongate/{id}/kas`; any request sent there is
//! rewritten and forwarded to the upstream by a per-session [`proxy::SessionProxy`], with
//! WebSocket upgrades (watches, exec-like flows) spliced through bidirectionally. Calling
//! [`registry::SessionRegistry::unregister`] tears the session down: every in-flight request
//! (including indefinitely streaming ones) is cancelled, and every connection the session ever
//! dialed is force-closed as a backstop.
//!
//! [`front::serve`] hosts the [`api::router`] HTTP surface (session dispatch, `/healthz`,
//! `/readyz`, `/metrics`) on a hand-rolled accept loop: accepted connections carry no read/write
//! deadlines, since one would eventually kill a long-lived upgraded stream, but do enforce a
//! `read_header_timeout` and an `idle_timeout` (see [`config::CoreConfig`]).
//!
//! This crate does not implement a control plane: the caller decides when sessions are created
//! and destroyed, and how `UpstreamClientConfig` credentials are minted and rotated.

mod api;
pub mod config;
pub mod front;
pub mod metrics;
pub mod proxy;
pub mod registry;
pub mod session_id;
mod tracker;
mod transport;
pub mod upstream;

pub use api::router;
pub use proxy::{ProxyConstructionError, SessionProxy};
pub use registry::{RegisterError, SessionRegistry};
pub use session_id::{InvalidSessionIdentifier, SessionIdentifier};
pub use upstream::{ClientIdentity, Credentials, TlsMaterial, UpstreamClientConfig, UpstreamConfigError};
