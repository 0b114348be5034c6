use slog::Drain;

/// Root logger for the binaries. Library code never builds its own logger;
/// it receives a child of this one, same as every other component.
pub fn root_logger(component: &str) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("Component" => component.to_string()))
}

/// Discard-everything logger for tests that don't assert on log output.
pub fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}
