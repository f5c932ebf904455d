//! Logging utilities with structured JSON output support.
//!
//! Supports both human-readable and JSON log formats for log aggregation.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};

/// Logging format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format (default)
    #[default]
    Pretty,
    /// JSON format for log aggregation
    Json,
    /// Compact single-line format
    Compact,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

/// Initialize logging with the default pretty format.
pub fn init_logging() {
    init_logging_with_format(LogFormat::Pretty);
}

/// Initialize logging with the specified format.
///
/// Set `RUST_LOG` environment variable to control log level.
/// A second call is a no-op (the first subscriber stays installed).
pub fn init_logging_with_format(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // try_init: ranks spawned in-process may race to install the subscriber.
    let _ = match format {
        LogFormat::Pretty => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(false)
            .with_line_number(false)
            .try_init(),
        LogFormat::Json => fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .flatten_event(true)
            .try_init(),
        LogFormat::Compact => fmt()
            .with_env_filter(filter)
            .compact()
            .with_target(false)
            .try_init(),
    };
}

/// Initialize logging based on environment variables.
///
/// Checks `INC_LOG_FORMAT` for format selection:
/// - "json" -> JSON format
/// - "compact" -> Compact format
/// - anything else -> Pretty format (default)
pub fn init_logging_from_env() {
    let format = std::env::var("INC_LOG_FORMAT")
        .map(|s| LogFormat::parse(&s))
        .unwrap_or(LogFormat::Pretty);

    init_logging_with_format(format);
}
