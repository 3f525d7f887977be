//! Main Entrypoint for the Livewire Proxy
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging and the shared application state.
//! 3. Starting the upstream connection health monitor.
//! 4. Serving the WebSocket router until Ctrl+C, then closing every upstream socket.

use anyhow::Context;
use livewire_proxy::{
    config::Config, router::create_router, state::AppState, ws::registry::run_health_monitor,
};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Listens for the `Ctrl+C` signal, then cancels `shutdown`.
async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Shared State ---
    let app_state = Arc::new(
        AppState::from_config(config.clone()).context("Failed to initialize application state")?,
    );
    let shutdown = app_state.shutdown.clone();

    // --- 4. Start the Health Monitor ---
    let monitor = tokio::spawn(run_health_monitor(
        app_state.registry.clone(),
        config.health_check_interval,
        config.keepalive_timeout,
        shutdown.clone(),
    ));

    // --- 5. Start Server ---
    let app = create_router(app_state);
    info!(
        model = %config.model_path(),
        upstream = %config.upstream_url,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await?;

    // The monitor closes any upstream sockets still registered.
    shutdown.cancel();
    monitor.await.context("Health monitor task failed")?;

    info!("Server has shut down.");
    Ok(())
}
