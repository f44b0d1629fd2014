//! Key Server
//!
//! Single-binary Rust service that:
//! 1. Loads pool sizing and timing from config
//! 2. Starts the key pool and its background sweeper
//! 3. Serves lease/release/delete/keep-alive over plain HTTP
//! 4. On SIGINT/SIGTERM, finishes open requests then stops the sweeper

mod config;
mod error;
mod metrics;
mod routes;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use key_pool::{KeyPool, spawn_sweeper};

use crate::config::Config;
use crate::routes::{AppState, build_router};

/// How long open requests get to finish once a stop signal arrives.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs; LOG_LEVEL wins over RUST_LOG, default info
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting key-server");

    // Pool and HTTP metrics both need the global recorder in place first
    let prometheus_handle = metrics::install_recorder()?;

    // Only flag: --config <path>
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let (config_path, explicit) = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), explicit, "loading configuration");

    let config = if explicit {
        Config::load(&config_path)
    } else {
        Config::load_or_default(&config_path)
    }
    .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        batch_size = config.pool.batch_size,
        lease_secs = config.pool.lease_secs,
        lifetime_secs = config.pool.lifetime_secs,
        sweep_interval_secs = config.pool.sweep_interval_secs,
        "configuration loaded"
    );

    let pool = Arc::new(KeyPool::new(config.pool.settings()));
    let sweeper = spawn_sweeper(pool.clone(), config.pool.sweep_interval());

    let app_state = AppState {
        pool,
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
    });

    wait_for_stop_signal().await;
    let _ = stop_tx.send(());
    drain(server).await;

    sweeper.shutdown().await;

    info!("shutdown complete");
    Ok(())
}

/// Give the server `DRAIN_TIMEOUT` to finish open requests after it was told to stop.
async fn drain(server: tokio::task::JoinHandle<std::io::Result<()>>) {
    match tokio::time::timeout(DRAIN_TIMEOUT, server).await {
        Ok(Ok(Ok(()))) => info!("server stopped cleanly"),
        Ok(Ok(Err(e))) => error!(error = %e, "server failed while stopping"),
        Ok(Err(e)) => error!(error = %e, "server task did not complete"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "requests still open after drain timeout, exiting anyway"
        ),
    }
}

/// Resolves on the first SIGINT or SIGTERM.
async fn wait_for_stop_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!(signal = "SIGINT", "stopping key-server"),
        _ = terminate => info!(signal = "SIGTERM", "stopping key-server"),
    }
}
