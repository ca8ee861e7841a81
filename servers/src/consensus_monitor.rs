//! # Cosmos Consensus Monitor
//!
//! Polls a Cosmos node for the active validator set and the live consensus
//! round, and pushes prevote / precommit participation to any number of
//! WebSocket display clients as sparse JSON patches.
//!
//! ## Components:
//! - **upstream**: `CosmosClient` + `ConsensusPoller`, one cycle per tick.
//! - **downstream**: axum WebSocket server on `/` and `/ws`, `/health`,
//!   `/status`, optional TLS.
//! - **config**: defaults, JSON file, environment and CLI flags.

use anyhow::Result;
use tokio::signal;

use lib_common::loggers::{init_logging, LoggingOptions};

mod monitor_logic;
use monitor_logic::{config, downstream, state, upstream};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let settings = config::load_config()?;
    let _log_guard = init_logging(&LoggingOptions::new(
        "consensus_monitor",
        settings.log_dir.clone(),
        &settings.log_level,
    ))?;

    match &settings.config_file {
        Some(path) => tracing::info!(path = %path.display(), "Config file merged."),
        None => tracing::info!("No config file found. Using defaults and environment/CLI variables."),
    }
    tracing::info!(
        api = %settings.api,
        rpc = %settings.rpc,
        port = settings.port,
        poll_interval_ms = settings.poll_interval.as_millis() as u64,
        request_timeout_ms = settings.request_timeout.as_millis() as u64,
        metric = %settings.metric,
        tls = settings.tls.is_some(),
        "Consensus monitor starting."
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let (poller, dispatcher) = upstream::build(&settings)?;
    let app_state = state::AppState::new(dispatcher, poller.stats(), settings.send_timeout);

    let upstream_handle = tokio::spawn(upstream::run(poller, shutdown_tx.subscribe()));

    let mut downstream_handle = tokio::spawn(downstream::run(
        settings.clone(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));

    // Wait for a shutdown signal, or for the server to stop on its own (bind/TLS failure)
    let early_exit = tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("Ctrl-C received, initiating shutdown.");
            None
        }
        _ = terminate() => {
            tracing::info!("SIGTERM received, initiating shutdown.");
            None
        }
        served = &mut downstream_handle => Some(served),
    };

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    // Wait for components to shut down
    let served = match early_exit {
        Some(served) => served,
        None => downstream_handle.await,
    };
    upstream_handle.await?;
    if let Err(e) = served? {
        tracing::error!(error = %e, "Downstream server failed.");
        return Err(e);
    }

    tracing::info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term_signal) => {
            term_signal.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for SIGTERM.");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    // On non-unix platforms, just wait forever.
    std::future::pending::<()>().await;
}
