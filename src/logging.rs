//! Logging setup

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter, e.g. `LLMAO_LOG=llmao=debug`
pub const LOG_ENV: &str = "LLMAO_LOG";

const DEFAULT_FILTER: &str = "warn";

/// Install a stderr subscriber filtered by `LLMAO_LOG`.
///
/// Returns `false` if a global subscriber was already set, in which case the
/// existing one is left alone.
pub fn init_logging() -> bool {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .is_ok()
}
