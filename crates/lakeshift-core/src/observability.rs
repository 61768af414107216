//! Logging initialization and span helpers.
//!
//! Every component logs through `tracing`. Binaries call [`init_logging`] once
//! at startup; library code only opens spans and emits events.

use std::str::FromStr;
use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::Error;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(Error::configuration(format!(
                "unknown log format '{other}' (expected json or pretty)"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; only the first call installs a subscriber, and
/// an already-installed global subscriber is left in place.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `lakeshift_flow=debug`)
///
/// # Example
///
/// ```rust
/// use lakeshift_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let _ = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init(),
        };
    });
}

/// Creates a span for a schema-change flow operation.
///
/// ```rust
/// use lakeshift_core::observability::flow_span;
///
/// let span = flow_span("submit", "01J0000000000000000000000", "weather");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn flow_span(operation: &str, flow_id: &str, family: &str) -> Span {
    tracing::info_span!(
        "schema_change",
        op = operation,
        flow_id = flow_id,
        family = family,
    )
}

/// Creates a span for job-controller operations.
#[must_use]
pub fn job_span(operation: &str, target: &str) -> Span {
    tracing::info_span!("job_control", op = operation, target = target)
}
