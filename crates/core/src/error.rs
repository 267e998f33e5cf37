//! Error taxonomy for index operations.
//!
//! Item-level failures (`DimensionMismatch`, `InvalidVector`, `NotFound`, ...)
//! reject a single operation and leave the index untouched. Whole-index
//! failures such as `CorruptPersistence` abort the call entirely.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("dimension mismatch: index has dimension {expected}, vector has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid vector: {0}")]
    InvalidVector(String),

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("id not found: {0}")]
    NotFound(String),

    #[error("corrupt persistence at {path}: {reason}")]
    CorruptPersistence { path: String, reason: String },

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    #[error(
        "quantization refused: recall@{k} dropped {degradation:.2} points (tolerance {tolerance:.2})"
    )]
    CalibrationFailed {
        k: usize,
        degradation: f32,
        tolerance: f32,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("storage directory is locked by another instance: {0}")]
    Locked(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl IndexError {
    /// Whether the caller may retry the same operation after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IndexError::CapacityExceeded(_))
    }

    pub(crate) fn corrupt(path: impl AsRef<std::path::Path>, reason: impl Into<String>) -> Self {
        IndexError::CorruptPersistence {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_capacity_is_retryable() {
        assert!(IndexError::CapacityExceeded("busy".into()).is_retryable());
        assert!(!IndexError::Cancelled.is_retryable());
        assert!(!IndexError::DimensionMismatch {
            expected: 3,
            actual: 4
        }
        .is_retryable());
    }

    #[test]
    fn test_messages_name_the_dimensions() {
        let msg = IndexError::DimensionMismatch {
            expected: 128,
            actual: 64,
        }
        .to_string();
        assert!(msg.contains("128") && msg.contains("64"));
    }
}
