//! Logging setup for the docpipe binaries.

/// Install the global subscriber configured by `RUST_LOG` and `DOCPIPE_LOG_FORMAT`.
///
/// Later calls leave the first subscriber in place.
pub fn init() {
    tracing::init(tracing::LogConfig::from_env());
}

pub mod tracing;
