//! Core error types for remex.

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Invalid encoding
    #[error("Invalid encoding: {reason}")]
    InvalidEncoding {
        /// What failed to encode or decode
        reason: String,
    },

    /// Invalid digest format
    #[error("Invalid digest: {reason}")]
    InvalidDigest {
        /// Why the digest was rejected
        reason: String,
    },

    /// Digest mismatch
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },

    /// Parse error
    #[error("Parse error: {message}")]
    ParseError {
        /// Error message
        message: String,
    },

    /// Validation error
    #[error("Validation failed for {field}: {reason}")]
    Validation {
        /// Offending field
        field: String,
        /// Reason
        reason: String,
    },

    /// Not found
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of the missing entity
        kind: String,
        /// Its identifier
        id: String,
    },
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidEncoding {
            reason: err.to_string(),
        }
    }
}

impl From<postcard::Error> for CoreError {
    fn from(err: postcard::Error) -> Self {
        Self::InvalidEncoding {
            reason: err.to_string(),
        }
    }
}
