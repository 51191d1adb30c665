use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cluster_admission::metrics::try_init_metrics;
use cluster_admission::{AppState, Config, InMemoryNodeRegistry, build_router, utils};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!(
        "Starting Cluster Admission v{}",
        env!("CARGO_PKG_VERSION")
    );

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Run the application, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        host = %config.host,
        port = %config.port,
        rate_limit_requests = config.rate_limit_requests,
        internal_rate_limit_requests = config.internal_rate_limit_requests,
        trusted_proxies = config.trusted_proxies.len(),
        "Configuration loaded"
    );

    if let Some(addr) = config.metrics_addr() {
        try_init_metrics(addr);
    }

    // Load the node registry
    let registry = match &config.cluster_nodes_file {
        Some(path) => InMemoryNodeRegistry::from_json_file(path).await.map_err(|e| {
            error!("Failed to load node registry: {e}");
            exitcode::NOINPUT
        })?,
        None => {
            warn!("CLUSTER_NODES_FILE not set, every cluster request will be rejected");
            InMemoryNodeRegistry::new()
        }
    };

    // Build application state and router
    let state = AppState::new(config.clone(), Arc::new(registry));
    state.spawn_reload_task();

    let app = build_router(state.clone()).map_err(|e| {
        error!("Failed to build router: {e}");
        exitcode::CONFIG
    })?;

    // Start server
    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET  /health                         - Health check");
    info!("  GET  /ready                          - Readiness check");
    info!("  GET  /api/internal/cluster/whoami    - Signed peer identity check");
    info!("  *    /*                              - S3 data path (rate limited)");

    // Peer addresses are required for client keys
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    // Gracefully shutdown background tasks
    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
