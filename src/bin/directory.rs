use fleetchat::{root_logger, start_directory, DirectoryConfig};
use std::process;

#[tokio::main]
async fn main() {
    let logger = root_logger("directory");

    let config = match DirectoryConfig::from_env(&logger) {
        Ok(config) => config,
        Err(e) => {
            slog::crit!(logger, "Invalid configuration: {}", e);
            process::exit(1);
        }
    };

    let handle = match start_directory(logger.clone(), config).await {
        Ok(handle) => handle,
        Err(e) => {
            slog::crit!(logger, "Directory failed to start: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        slog::crit!(logger, "Could not listen for shutdown signal: {}", e);
        process::exit(1);
    }
    slog::info!(logger, "Shutting down directory at '{}'", handle.endpoint);
    drop(handle);
}
