use anyhow::{Context, Result};
use lib_common::sessions::Sweeper;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod rooms_logic;
use rooms_logic::{config, downstream, logger, state};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let settings = config::load_config().resolve().context("resolving configuration")?;
    let _log_guard = logger::setup_logging(&settings.log_dir, &settings.log_level)?;
    info!(port = settings.port, "Starting server_rooms");

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let app_state = state::build_state(&settings).await?;

    let link_handle = tokio::spawn(
        Arc::clone(&app_state.link).run(
            Arc::clone(&app_state.supervisor),
            Arc::clone(&app_state.publisher),
            shutdown_tx.subscribe(),
        ),
    );

    let sweeper = Sweeper::new(
        app_state.engine.clone(),
        Arc::clone(&app_state.publisher),
        settings.sweep_interval,
    );
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown_tx.subscribe()));

    let mut downstream_handle = tokio::spawn(downstream::run(
        settings.port,
        settings.tls.clone(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal, or for the HTTP server to stop on its own
    let server_exit = tokio::select! {
        _ = shutdown_signal() => None,
        res = &mut downstream_handle => Some(res),
    };

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());
    app_state.shutdown.cancel();

    let server_result = match server_exit {
        Some(res) => res,
        None => downstream_handle.await,
    };
    match server_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Downstream server failed"),
        Err(e) => error!(error = %e, "Downstream server task panicked"),
    }

    // Wait for the remaining components to shut down
    if let Err(e) = tokio::try_join!(link_handle, sweeper_handle) {
        warn!(error = %e, "Background task ended abnormally");
    }

    info!("Shutdown complete.");
    Ok(())
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received, initiating shutdown."),
        _ = terminate => info!("SIGTERM received, initiating shutdown."),
    }
}
