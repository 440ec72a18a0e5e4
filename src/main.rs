/**
 * facematch server
 * Encrypted face template matching behind a small JSON API
 *
 * Handles:
 * - Feature extraction (via the external embedding model) and template sealing
 * - Template comparison and batch best-match search
 * - Enrollment and authentication with one audited decision per attempt
 */

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use facematch::api;
use facematch::config::ServiceConfig;
use facematch::BiometricService;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting facematch server");

    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("Refusing to start: {}", err);
            std::process::exit(2);
        }
    };
    let bind = config.bind;
    let threshold = config.matching.threshold;
    let dimension = config.matching.dimension;

    // The service owns the key for the life of the process
    let biometric = match BiometricService::from_config(config) {
        Ok(service) => Arc::new(service),
        Err(err) => {
            error!("Failed to initialise biometric service: {}", err);
            std::process::exit(2);
        }
    };
    info!(
        "Model {} (dimension {}, threshold {:.2})",
        biometric.model_name(),
        dimension,
        threshold
    );

    let app = api::router(biometric);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .expect("Failed to bind listen address");

    info!("facematch server listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server failed to start");

    info!("facematch server stopped");
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", err);
        // keep serving rather than shutting down on a broken signal handler
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
