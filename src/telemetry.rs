//! Logging setup.
//!
//! Events are written to stderr so that a service manager (systemd journal,
//! container runtime) can capture them. JSON is the default format; every
//! event carries `timestamp`, `level` and `message` plus its structured
//! fields (`ip`, `gate`, `topic`, `payload`, `error`, `response_time_ms`).

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info";

/// Output format for log events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human-readable multi-field lines
    Pretty,
}

/// Install the global tracing subscriber.
///
/// Fails if a global subscriber has already been installed.
pub fn init(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .try_init(),
        LogFormat::Pretty => builder.with_thread_ids(true).try_init(),
    }
}
