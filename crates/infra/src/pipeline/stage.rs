//! The contract every processing step implements.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use docpipe_jobs::JobConfig;

/// Classification of a stage failure, which decides retry behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// Network hiccup, rate limit, upstream 5xx.
    Transient,
    /// The stage exceeded its time budget.
    Timeout,
    /// The input can never succeed.
    Validation,
    /// Output was produced but rejected by a quality check.
    QualityGate,
    /// Anything unexpected, including panics.
    Fatal,
}

impl StageErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageErrorKind::Transient => "transient",
            StageErrorKind::Timeout => "timeout",
            StageErrorKind::Validation => "validation",
            StageErrorKind::QualityGate => "quality_gate",
            StageErrorKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed stage invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct StageError {
    pub kind: StageErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Transient, message, true)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            StageErrorKind::Timeout,
            format!("stage timed out after {}s", after.as_secs_f64()),
            true,
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Validation, message, false)
    }

    pub fn quality_gate(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::QualityGate, message, false)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Fatal, message, false)
    }

    fn new(kind: StageErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
        }
    }
}

/// One processing step of the pipeline.
///
/// A stage is a pure function of its input and the job config as far as the
/// pipeline is concerned: it never touches job state.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, input: JsonValue, config: &JobConfig) -> Result<JsonValue, StageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_and_timeout_errors_are_retryable() {
        assert!(StageError::transient("rate limited").retryable);
        assert!(StageError::timeout(Duration::from_secs(5)).retryable);
        assert!(!StageError::validation("empty document").retryable);
        assert!(!StageError::quality_gate("too few cards").retryable);
        assert!(!StageError::fatal("boom").retryable);
    }

    #[test]
    fn display_includes_kind() {
        let err = StageError::quality_gate("too few cards");
        assert_eq!(err.to_string(), "quality_gate error: too few cards");
    }
}
