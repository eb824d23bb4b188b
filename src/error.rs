//! Error handling for rotadb
//!
//! This module provides error types and result aliases for shard management,
//! rotation and cross-shard query operations.

use std::io;
use thiserror::Error;

/// Errors that can occur in rotadb operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration values or malformed administrative input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Duplicate rotation target, concurrent rotation or business-key collision
    #[error("Conflict: {0}")]
    Conflict(String),

    /// No match across any selected shard
    #[error("Not found: {0}")]
    NotFound(String),

    /// More than one row matched a lookup that expects a single row
    #[error("Ambiguous result: {0}")]
    Ambiguous(String),

    /// A row fetched from a non-current shard was used in a write
    #[error("Write safety violation: row from shard '{shard}' cannot be written to current shard '{current}'")]
    WriteSafetyViolation {
        shard: String,
        current: String,
    },

    /// One shard failed during a fan-out read
    #[error("Partial failure on shard '{shard}': {source}")]
    PartialFailure {
        shard: String,
        #[source]
        source: Box<Error>,
    },

    /// Errors related to storage operations
    #[error("Storage error: {0}")]
    Storage(String),

    /// Errors related to data corruption
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// Errors related to I/O operations
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Errors related to serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error type for other cases
    #[error("{0}")]
    Other(String),
}

/// Result type for rotadb operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a new conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Create a new not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a new ambiguous result error
    pub fn ambiguous(message: impl Into<String>) -> Self {
        Self::Ambiguous(message.into())
    }

    /// Create a new write safety violation
    pub fn write_safety(shard: impl Into<String>, current: impl Into<String>) -> Self {
        Self::WriteSafetyViolation {
            shard: shard.into(),
            current: current.into(),
        }
    }

    /// Wrap an error raised by one shard during fan-out
    pub fn partial_failure(shard: impl Into<String>, source: Error) -> Self {
        Self::PartialFailure {
            shard: shard.into(),
            source: Box::new(source),
        }
    }

    /// Create a new storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a new corruption error
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption(message.into())
    }

    /// Create a new serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a new generic error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Check if this is a validation error
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Check if this is a conflict error
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if a single-row lookup matched several rows
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Ambiguous(_))
    }

    /// Check if this is a write safety violation
    pub fn is_write_safety_violation(&self) -> bool {
        matches!(self, Self::WriteSafetyViolation { .. })
    }

    /// Check if this is a partial failure
    pub fn is_partial_failure(&self) -> bool {
        matches!(self, Self::PartialFailure { .. })
    }

    /// Check if this is a corruption error
    pub fn is_corruption_error(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }

    /// Check if this is an I/O error
    pub fn is_io_error(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Stable machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Ambiguous(_) => "ambiguous",
            Self::WriteSafetyViolation { .. } => "write_safety_violation",
            Self::PartialFailure { .. } => "partial_failure",
            Self::Storage(_) => "storage",
            Self::Corruption(_) => "corruption",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Other(_) => "other",
        }
    }

    /// Get a user-friendly suggestion for resolving the error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::Conflict(_) => Some("The shard or key already exists, or a rotation is running; reload the current state before retrying".to_string()),
            Self::WriteSafetyViolation { .. } => Some("Fetch the referenced row from the current shard before writing".to_string()),
            Self::Io(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                Some("Verify permissions on the shard storage directory".to_string())
            }
            Self::Corruption(_) => Some("Data corruption detected. Consider restoring the shard file from a backup".to_string()),
            _ => None,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(format!("Bincode error: {}", err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::conflict("shard_2024-01-01 already exists");
        assert!(err.is_conflict());
        assert_eq!(err.kind(), "conflict");

        let err = Error::conflict("device with key dev-1 already exists in shard default");
        let hint = err.suggestion().unwrap();
        assert!(hint.contains("key already exists"));
        assert!(!hint.contains("Another rotation"));

        let err = Error::write_safety("default", "shard_2024-01-01");
        assert!(err.is_write_safety_violation());
        assert!(err.to_string().contains("'default'"));
        assert!(err.suggestion().unwrap().contains("current shard"));
    }

    #[test]
    fn test_partial_failure_keeps_source() {
        let err = Error::partial_failure("shard_2023", Error::corruption("bad checksum"));
        assert!(err.is_partial_failure());
        assert_eq!(err.kind(), "partial_failure");

        match err {
            Error::PartialFailure { shard, source } => {
                assert_eq!(shard, "shard_2023");
                assert!(source.is_corruption_error());
            }
            _ => panic!("expected partial failure"),
        }
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let err = Error::from(io_err);
        assert!(err.is_io_error());

        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err = Error::from(json_err);
        assert_eq!(err.kind(), "serialization");
    }
}
