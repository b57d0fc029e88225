//! `sessiongate`: standalone binary hosting the session gate's front server.
//!
//! Installs the default TLS crypto provider, wires up tracing and Prometheus metrics, optionally
//! pre-registers a static set of sessions from disk (see [`sessions_file`]), then serves until a
//! shutdown signal arrives.

use std::path::PathBuf;

use clap::Parser;
use eyre::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use sessiongate_core::config::CoreConfig;
use sessiongate_core::registry::SessionRegistry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

mod sessions_file;

/// Command-line configuration for the `sessiongate` binary.
#[derive(Parser, Debug)]
#[clap(version)]
struct AppConfig {
    #[clap(flatten)]
    core: CoreConfig,

    /// Path to a YAML file statically describing the sessions to register at startup.
    ///
    /// This binary has no control plane of its own; see [`sessions_file`] for the file's shape
    /// and what it stands in for.
    #[clap(long, env = "SESSIONGATE_SESSIONS_FILE")]
    sessions_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("no other default rustls crypto provider installed yet");

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AppConfig::parse();
    tracing::info!(?config, "starting sessiongate");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("installing the Prometheus metrics recorder")?;
    sessiongate_core::metrics::describe_metrics();

    let shutdown = CancellationToken::new();
    let registry = SessionRegistry::new(
        config.core.ingress_base_url.to_string(),
        shutdown.child_token(),
    );

    if let Some(path) = &config.sessions_file {
        let sessions =
            sessions_file::load(path).with_context(|| format!("loading {}", path.display()))?;
        for (id, upstream) in sessions {
            let endpoint = registry
                .register(id.clone(), upstream)
                .await
                .with_context(|| format!("registering session {id} from the sessions file"))?;
            tracing::info!(session = %id, %endpoint, "registered session from sessions file");
        }
        tracing::info!(count = registry.len(), "finished loading sessions file");
    }

    let app = sessiongate_core::router(registry.clone(), prometheus_handle);

    let listener = TcpListener::bind(config.core.bind_address)
        .await
        .with_context(|| format!("binding {}", config.core.bind_address))?;
    tracing::info!(bind_address = %config.core.bind_address, "front server listening");

    let core_config = config.core.clone();
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        sessiongate_core::front::serve(listener, app, &core_config, server_shutdown).await
    });

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received");
    shutdown.cancel();

    match server.await {
        Ok(Ok(())) => tracing::info!("front server shut down cleanly"),
        Ok(Err(err)) => tracing::error!(error = %err, "front server exited with an error"),
        Err(err) => tracing::error!(error = %err, "front server task panicked"),
    }

    registry.shutdown().await;
    Ok(())
}

/// Resolves once SIGINT or (on Unix) SIGTERM is received.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
