use fleetchat::{root_logger, start_router, RouterConfig};
use std::process;

#[tokio::main]
async fn main() {
    let logger = root_logger("router");

    let config = match RouterConfig::from_env(&logger) {
        Ok(config) => config,
        Err(e) => {
            slog::crit!(logger, "Invalid configuration: {}", e);
            process::exit(1);
        }
    };

    let handle = match start_router(logger.clone(), config).await {
        Ok(handle) => handle,
        Err(e) => {
            slog::crit!(logger, "Router failed to start: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        slog::crit!(logger, "Could not listen for shutdown signal: {}", e);
        process::exit(1);
    }
    slog::info!(
        logger,
        "Shutting down router ({} / {})",
        handle.frontend_endpoint,
        handle.backend_endpoint
    );
    drop(handle);
}
