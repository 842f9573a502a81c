//! Tracing subscriber setup for the binary. Library code only emits events.

use tracing_subscriber::EnvFilter;

/// Environment variable overriding the configured log filter.
pub const LOG_ENV: &str = "FACTFLOW_LOG";

/// Install a stderr `fmt` subscriber. `FACTFLOW_LOG` wins over `configured`;
/// an unparsable filter falls back to `info`. Safe to call more than once.
pub fn init_tracing(configured: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(configured))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
