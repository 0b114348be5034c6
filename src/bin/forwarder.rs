use fleetchat::{root_logger, start_forwarder, ForwarderConfig};
use std::process;

#[tokio::main]
async fn main() {
    let logger = root_logger("forwarder");

    let config = match ForwarderConfig::from_env(&logger) {
        Ok(config) => config,
        Err(e) => {
            slog::crit!(logger, "Invalid configuration: {}", e);
            process::exit(1);
        }
    };

    let handle = match start_forwarder(logger.clone(), config).await {
        Ok(handle) => handle,
        Err(e) => {
            slog::crit!(logger, "Forwarder failed to start: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        slog::crit!(logger, "Could not listen for shutdown signal: {}", e);
        process::exit(1);
    }
    slog::info!(
        logger,
        "Shutting down forwarder ({} / {})",
        handle.xsub_endpoint,
        handle.xpub_endpoint
    );
    drop(handle);
}
