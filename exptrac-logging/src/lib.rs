//! Structured logging setup for the Exptrac key services
//!
//! Key material must never reach a log line. Callers log versions, slot
//! names and backup ids only.

use std::fmt;
use std::str::FromStr;
use tracing_subscriber::{
    fmt as fmt_layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line (production)
    Json,
    /// Human-readable lines (development)
    #[default]
    Console,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "console" | "pretty" | "text" => Ok(LogFormat::Console),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Json => write!(f, "json"),
            LogFormat::Console => write!(f, "console"),
        }
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `default_level` when set. Returns an error instead of
/// panicking when a subscriber is already installed, so tests and embedding
/// hosts can call this more than once.
pub fn init_logging(
    service_name: &str,
    default_level: &str,
    format: LogFormat,
) -> Result<(), TryInitError> {
    let registry = tracing_subscriber::registry().with(env_filter(default_level));

    match format {
        LogFormat::Json => registry
            .with(
                fmt_layer::layer()
                    .json()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_current_span(false)
                    .with_span_list(false),
            )
            .try_init()?,
        LogFormat::Console => registry
            .with(
                fmt_layer::layer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()?,
    }

    tracing::info!(service = service_name, format = %format, "Logging initialized");
    Ok(())
}

/// Console logging for development tools, ignoring a second initialisation
pub fn init_console_logging(service_name: &str, default_level: &str) {
    if init_logging(service_name, default_level, LogFormat::Console).is_err() {
        tracing::debug!(service = service_name, "Subscriber already installed");
    }
}
