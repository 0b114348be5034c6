use fleetchat::{root_logger, start_replica, ReplicaConfig};
use std::process;

#[tokio::main]
async fn main() {
    let logger = root_logger("replica");

    let config = match ReplicaConfig::from_env(&logger) {
        Ok(config) => config,
        Err(e) => {
            slog::crit!(logger, "Invalid configuration: {}", e);
            process::exit(1);
        }
    };

    let handle = match start_replica(logger.clone(), config).await {
        Ok(handle) => handle,
        Err(e) => {
            slog::crit!(logger, "Replica failed to start: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        slog::crit!(logger, "Could not listen for shutdown signal: {}", e);
        process::exit(1);
    }
    slog::info!(logger, "Shutting down '{}'", handle.name());
    drop(handle);
}
