//! Tracing/logging initialization.
//!
//! `RUST_LOG` controls filtering (default `info`). `DOCPIPE_LOG_FORMAT=pretty`
//! switches from JSON lines to human-readable output for local runs.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(LogFormat::Json),
            "pretty" | "text" => Some(LogFormat::Pretty),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Used when `RUST_LOG` is unset or invalid.
    pub default_filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        let format = std::env::var("DOCPIPE_LOG_FORMAT")
            .ok()
            .and_then(|raw| LogFormat::parse(&raw))
            .unwrap_or_default();
        Self {
            format,
            ..Self::default()
        }
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(config: LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = match config.format {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}
