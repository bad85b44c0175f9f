//! Error types for Arbor.

use thiserror::Error;

/// Result type alias using ArborError.
pub type Result<T> = std::result::Result<T, ArborError>;

/// Errors that can occur in Arbor operations.
#[derive(Debug, Error)]
pub enum ArborError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("end of data at offset {offset}")]
    Eof { offset: u64 },

    // Codec errors
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("relative offset {value} exceeds {bits}-bit range")]
    OffsetOverflow { value: i64, bits: u8 },

    #[error("corrupted record at offset {offset}: {reason}")]
    Corrupted { offset: u64, reason: String },

    // Tree errors
    #[error("duplicate key")]
    DuplicateKey,

    #[error("key not found")]
    KeyNotFound,

    #[error("value not found for record pointer")]
    ValueNotFound,

    #[error("not enough space: requested {requested} bytes, {available} available")]
    NoSpace { requested: u64, available: u64 },

    #[error("tree rebuild required: {0}")]
    RebuildRequired(String),

    // Locking
    #[error("lock '{name}' not acquired within {timeout_ms}ms")]
    LockTimeout { name: String, timeout_ms: u64 },

    // Transactions
    #[error("rollback failed after '{original}': {rollback}")]
    RollbackFailed {
        original: Box<ArborError>,
        rollback: Box<ArborError>,
    },

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl ArborError {
    /// Returns true if this error signals exhausted space (leaf body,
    /// ext_data block, or file-level free space).
    pub fn is_no_space(&self) -> bool {
        matches!(self, ArborError::NoSpace { .. })
    }

    /// Wraps this error as the original of a failed rollback.
    pub fn with_rollback_failure(self, rollback: ArborError) -> ArborError {
        ArborError::RollbackFailed {
            original: Box::new(self),
            rollback: Box::new(rollback),
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
        let err: ArborError = io_err.into();
        assert!(matches!(err, ArborError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_eof_display() {
        let err = ArborError::Eof { offset: 1024 };
        assert_eq!(err.to_string(), "end of data at offset 1024");
    }

    #[test]
    fn test_offset_overflow_display() {
        let err = ArborError::OffsetOverflow {
            value: 1 << 33,
            bits: 31,
        };
        assert!(err.to_string().contains("31-bit"));
    }

    #[test]
    fn test_no_space_display() {
        let err = ArborError::NoSpace {
            requested: 512,
            available: 100,
        };
        assert_eq!(
            err.to_string(),
            "not enough space: requested 512 bytes, 100 available"
        );
        assert!(err.is_no_space());
    }

    #[test]
    fn test_lock_timeout_display() {
        let err = ArborError::LockTimeout {
            name: "idx:users".to_string(),
            timeout_ms: 5000,
        };
        assert_eq!(
            err.to_string(),
            "lock 'idx:users' not acquired within 5000ms"
        );
    }

    #[test]
    fn test_rollback_failure_attachment() {
        let original = ArborError::NoSpace {
            requested: 64,
            available: 0,
        };
        let err = original.with_rollback_failure(ArborError::Internal("write failed".to_string()));

        match &err {
            ArborError::RollbackFailed { original, rollback } => {
                assert!(original.is_no_space());
                assert!(matches!(**rollback, ArborError::Internal(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("rollback failed"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ArborError>();
    }
}
