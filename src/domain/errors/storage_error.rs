//! Disk tier error types.

use std::io;

use thiserror::Error;

/// Result type for disk tier operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Disk tier failures.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum StorageError {
    #[error("storage unavailable at {path}: {message}")]
    Unavailable { path: String, message: String },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("storage task failed: {message}")]
    Task { message: String },
}

impl StorageError {
    /// Creates unavailable error.
    #[must_use]
    pub fn unavailable(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates task error.
    #[must_use]
    pub fn task(message: impl Into<String>) -> Self {
        Self::Task {
            message: message.into(),
        }
    }
}
