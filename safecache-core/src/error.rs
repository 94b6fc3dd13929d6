//! Error types for safecache operations

use thiserror::Error;

/// Storage layer errors.
///
/// Only [`StorageError::Timeout`] is transient. Every other variant is a hard
/// fault and reaches the caller unchanged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage timed out during {operation}: {reason}")]
    Timeout { operation: String, reason: String },

    #[error("Store handle for {location} is closed")]
    Closed { location: String },

    #[error("Store corrupted: {reason}")]
    Corrupted { reason: String },

    #[error("Storage I/O error: {reason}")]
    Io { reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    /// Shorthand for a timeout raised by `operation`.
    pub fn timeout(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        StorageError::Timeout {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all safecache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SafeCacheError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },
}

impl SafeCacheError {
    /// Whether this is the transient storage timeout that drives retries.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SafeCacheError::Storage(StorageError::Timeout { .. }))
    }

    /// Whether the error came from a handle that has already been closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, SafeCacheError::Storage(StorageError::Closed { .. }))
    }
}

impl From<serde_json::Error> for SafeCacheError {
    fn from(e: serde_json::Error) -> Self {
        SafeCacheError::Serialization {
            reason: e.to_string(),
        }
    }
}

/// Result type alias for safecache operations.
pub type SafeCacheResult<T> = Result<T, SafeCacheError>;

// =============================================================================
// TESTS
// =============================================================================
