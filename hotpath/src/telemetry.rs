//! Structured logging bootstrap.
//!
//! Components log through `tracing` macros only; the embedding service calls
//! one of these functions once at startup. The filter comes from `RUST_LOG`
//! and defaults to `info`.

use serde::{Deserialize, Serialize};
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the log layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event, for log shipping
    #[default]
    Json,
    /// Human-readable single-line output
    Compact,
}

/// Installs the global subscriber, failing if one is already set.
pub fn try_init_logging(format: LogFormat) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_layer = matches!(format, LogFormat::Json).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
    });
    let compact_layer = matches!(format, LogFormat::Compact)
        .then(|| tracing_subscriber::fmt::layer().compact().with_target(true));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(compact_layer)
        .try_init()
}

/// Installs the global subscriber, ignoring an already-installed one.
pub fn init_logging(format: LogFormat) {
    if try_init_logging(format).is_err() {
        tracing::debug!("global tracing subscriber already installed");
    }
}
