//! Configuration types and CLI/environment parsing for the session gate core.
//!
//! Hosting binaries may have a more detailed config and flatten this one in with
//! `#[clap(flatten)]`.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

/// Core configuration for the session gate's front server.
///
/// Configurable via environment variables or command line arguments using `clap`.
#[derive(Parser, Debug, Clone)]
pub struct CoreConfig {
    /// Local address the front server listens on.
    #[clap(long, env = "SESSIONGATE_BIND_ADDRESS")]
    pub bind_address: SocketAddr,

    /// Externally-visible base URL used to construct a session's public endpoint.
    #[clap(long, env = "SESSIONGATE_INGRESS_BASE_URL")]
    pub ingress_base_url: url::Url,

    /// Max time the server waits for in-flight, non-hijacked requests to drain on shutdown.
    #[clap(
        long,
        env = "SESSIONGATE_GRACEFUL_SHUTDOWN_TIMEOUT",
        default_value = "5s",
        value_parser = humantime::parse_duration,
    )]
    pub graceful_shutdown_timeout: Duration,

    /// Max time a client may take to send request headers after opening a connection.
    #[clap(
        long,
        env = "SESSIONGATE_READ_HEADER_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration,
    )]
    pub read_header_timeout: Duration,

    /// Max time a keep-alive connection may sit idle between requests.
    #[clap(
        long,
        env = "SESSIONGATE_IDLE_TIMEOUT",
        default_value = "120s",
        value_parser = humantime::parse_duration,
    )]
    pub idle_timeout: Duration,
}
