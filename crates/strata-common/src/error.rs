//! Error types for Strata.

use thiserror::Error;

/// Result type alias using StrataError.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Errors that can occur in Strata storage operations.
#[derive(Debug, Error)]
pub enum StrataError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Input errors
    #[error("Page size mismatch: expected {expected}, got {actual}")]
    PageSizeMismatch { expected: usize, actual: usize },

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Resource errors
    #[error("Resource closed: {0}")]
    Closed(String),

    #[error("Range not found: {range_number} at version {version}")]
    RangeNotFound { range_number: i64, version: i64 },

    #[error("Index corrupted: {0}")]
    IndexCorrupted(String),

    // Contention
    #[error("Compaction already in progress")]
    CompactionInProgress,

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Unrecoverable
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl StrataError {
    /// Returns true if the error leaves the database shard in a state that
    /// must not be used again without manual recovery.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StrataError::InvariantViolation(_))
    }

    /// Builds an `InvalidParameter` error from any displayable value.
    pub fn invalid_parameter(name: &str, value: impl std::fmt::Display) -> Self {
        StrataError::InvalidParameter {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: StrataError = io_err.into();
        assert!(matches!(err, StrataError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_page_size_mismatch_display() {
        let err = StrataError::PageSizeMismatch {
            expected: 4096,
            actual: 100,
        };
        assert_eq!(err.to_string(), "Page size mismatch: expected 4096, got 100");
    }

    #[test]
    fn test_range_not_found_display() {
        let err = StrataError::RangeNotFound {
            range_number: 3,
            version: 42,
        };
        assert_eq!(err.to_string(), "Range not found: 3 at version 42");
    }

    #[test]
    fn test_invalid_parameter_helper() {
        let err = StrataError::invalid_parameter("offset", -1);
        assert_eq!(err.to_string(), "Invalid parameter: offset = -1");
    }

    #[test]
    fn test_only_invariant_violation_is_fatal() {
        assert!(StrataError::InvariantViolation("corrupted range index".into()).is_fatal());
        assert!(!StrataError::CompactionInProgress.is_fatal());
        assert!(!StrataError::Closed("range".into()).is_fatal());
        assert!(!StrataError::IndexCorrupted("short".into()).is_fatal());
    }

    #[test]
    fn test_compaction_in_progress_display() {
        assert_eq!(
            StrataError::CompactionInProgress.to_string(),
            "Compaction already in progress"
        );
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StrataError>();
    }
}
