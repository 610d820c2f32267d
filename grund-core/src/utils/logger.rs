use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing subscriber for a service.
///
/// `RUST_LOG` takes precedence over the configured level. JSON output is
/// meant for aggregated environments; the plain layer keeps targets and
/// thread ids for local debugging.
pub fn init_logging(log_level: &str, json_logs: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

/// Same as [`init_logging`] but tolerates an already-installed subscriber.
///
/// Background tasks and tests may race on initialization; the second call
/// becomes a no-op instead of a panic.
pub fn try_init_logging(log_level: &str) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}
