//! Optimistic concurrency expectations.

use std::fmt;

use crate::error::{DomainError, DomainResult};

/// Optimistic concurrency expectation for a versioned record.
///
/// Every mutation of a job carries the caller's last-known version; a store
/// rejects the write when the record has moved on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking. Only used by store-internal atomic operations
    /// (cancellation requests) that re-read and write under one lock.
    Any,
    /// Require the record to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    /// Fails with [`DomainError::VersionMismatch`] when `actual` is not the
    /// expected version.
    pub fn check(self, actual: u64) -> DomainResult<()> {
        match self {
            ExpectedVersion::Exact(expected) if expected != actual => {
                Err(DomainError::VersionMismatch { expected, actual })
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => f.write_str("any"),
            ExpectedVersion::Exact(v) => write!(f, "{v}"),
        }
    }
}

impl From<u64> for ExpectedVersion {
    fn from(value: u64) -> Self {
        ExpectedVersion::Exact(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_version_must_match() {
        assert!(ExpectedVersion::Exact(3).check(3).is_ok());
        assert!(ExpectedVersion::Exact(3).check(4).is_err());
        assert!(ExpectedVersion::Any.check(42).is_ok());
    }

    #[test]
    fn check_reports_both_versions() {
        let err = ExpectedVersion::Exact(1).check(2).unwrap_err();
        assert_eq!(err, DomainError::VersionMismatch { expected: 1, actual: 2 });
        assert!(ExpectedVersion::Any.check(7).is_ok());
    }

    #[test]
    fn displays_as_a_plain_version() {
        assert_eq!(ExpectedVersion::Exact(3).to_string(), "3");
        assert_eq!(ExpectedVersion::Any.to_string(), "any");
    }
}
