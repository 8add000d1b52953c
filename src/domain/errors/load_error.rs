//! Errors surfaced to callers of a load.

use thiserror::Error;

use super::TransportError;

/// Why a load finished without an artifact.
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum LoadError {
    #[error("url is blacklisted: {url}")]
    Blacklisted { url: String },

    #[error("download finished without data: {url}")]
    NoData { url: String },

    #[error("invalid data: decoder produced nothing")]
    InvalidData,

    #[error("edit failed for editor {editor_key}")]
    EditFailed { editor_key: String },

    #[error("transient network failure: {source}")]
    NetworkTransient { source: TransportError },

    #[error("network failure: {source}")]
    NetworkPermanent { source: TransportError },

    #[error("storage unavailable: {message}")]
    StorageUnavailable { message: String },
}

impl LoadError {
    /// Creates blacklisted error.
    #[must_use]
    pub fn blacklisted(url: impl Into<String>) -> Self {
        Self::Blacklisted { url: url.into() }
    }

    /// Creates no data error.
    #[must_use]
    pub fn no_data(url: impl Into<String>) -> Self {
        Self::NoData { url: url.into() }
    }

    /// Creates edit failed error.
    #[must_use]
    pub fn edit_failed(editor_key: impl Into<String>) -> Self {
        Self::EditFailed {
            editor_key: editor_key.into(),
        }
    }

    /// Creates storage unavailable error.
    #[must_use]
    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            message: message.into(),
        }
    }

    /// Classifies a transport failure.
    #[must_use]
    pub fn from_transport(source: TransportError) -> Self {
        if source.is_transient() {
            Self::NetworkTransient { source }
        } else {
            Self::NetworkPermanent { source }
        }
    }

    /// Returns whether an immediate retry can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkTransient { .. })
    }

    /// Returns whether this failure puts the URL on the blacklist.
    #[must_use]
    pub const fn blacklists_url(&self) -> bool {
        matches!(self, Self::NetworkPermanent { .. } | Self::NoData { .. })
    }
}

impl From<TransportError> for LoadError {
    fn from(source: TransportError) -> Self {
        Self::from_transport(source)
    }
}
