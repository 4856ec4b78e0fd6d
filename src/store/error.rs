//! Error types for persistence operations.

use thiserror::Error;

/// Errors that can occur during persistence operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error in the backing store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error serializing or deserializing stored data.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// No stored state for the requested channel.
    #[error("channel not found: {0}")]
    NotFound(String),
}

impl StorageError {
    /// Create a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a not-found error.
    pub fn not_found(channel_id: impl Into<String>) -> Self {
        Self::NotFound(channel_id.into())
    }
}

/// Convenience type alias for persistence results.
pub type StorageResult<T> = Result<T, StorageError>;
