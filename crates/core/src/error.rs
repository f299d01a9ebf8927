//! Errors raised by pure job logic, before any storage is involved.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Submitted input or configuration is unusable as given.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A job or worker id did not parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A compare-and-swap write saw a different version than it expected.
    #[error("version mismatch: expected {expected}, found {actual}")]
    VersionMismatch { expected: u64, actual: u64 },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
