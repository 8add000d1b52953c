//! Network transport error types.

use thiserror::Error;

/// Coarse classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Request or body read exceeded its deadline.
    Timeout,
    /// Host lookup or connection setup failed, or the connection dropped.
    Connect,
    /// Operation was cancelled before it finished.
    Cancelled,
    /// Server answered with an error status (or 304).
    Status(u16),
    /// Body could not be read.
    Body,
    /// Anything else (malformed URL, unsupported scheme, local file missing).
    Other,
}

/// Failure reported by the network layer for one download operation.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    /// Classification.
    pub kind: TransportErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl TransportError {
    /// Creates a transport error of the given kind.
    #[must_use]
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    /// Creates a connection error.
    #[must_use]
    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Connect, message)
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(TransportErrorKind::Cancelled, "operation cancelled")
    }

    /// Creates an HTTP status error.
    #[must_use]
    pub fn status(code: u16) -> Self {
        Self::new(TransportErrorKind::Status(code), format!("HTTP {code}"))
    }

    /// Creates a body read error.
    #[must_use]
    pub fn body(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Body, message)
    }

    /// Creates an unclassified error.
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Other, message)
    }

    /// Returns whether the failure is connectivity-related and worth retrying
    /// right away. Transient failures never blacklist a URL.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Timeout | TransportErrorKind::Connect | TransportErrorKind::Cancelled
        )
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::timeout(e.to_string())
        } else if e.is_connect() {
            Self::connect(e.to_string())
        } else if let Some(status) = e.status() {
            Self::status(status.as_u16())
        } else if e.is_body() || e.is_decode() {
            Self::body(e.to_string())
        } else {
            Self::other(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(TransportError::timeout("t"), true ; "timeout")]
    #[test_case(TransportError::connect("c"), true ; "connect")]
    #[test_case(TransportError::cancelled(), true ; "cancelled")]
    #[test_case(TransportError::status(404), false ; "not_found")]
    #[test_case(TransportError::status(304), false ; "not_modified")]
    #[test_case(TransportError::body("b"), false ; "body")]
    #[test_case(TransportError::other("o"), false ; "other")]
    fn test_transient_classification(error: TransportError, transient: bool) {
        assert_eq!(error.is_transient(), transient);
    }
}
