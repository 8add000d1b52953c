//! Load request and result DTOs.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::domain::entities::{Artifact, DecodedImage, LoadOptions, Resource, Tier};
use crate::domain::errors::LoadError;
use crate::domain::ports::Editor;

/// Download progress forwarded to the caller of a load.
#[derive(Debug, Clone)]
pub struct LoadProgress {
    /// Bytes received so far.
    pub received: u64,
    /// Announced body size.
    pub expected: Option<u64>,
    /// Partial image, for progressive loads.
    pub partial: Option<Arc<DecodedImage>>,
}

/// One load: what to fetch and how.
#[derive(Clone)]
pub struct LoadRequest {
    /// What to load.
    pub resource: Resource,
    /// Behavior flags.
    pub options: LoadOptions,
    /// Edit applied to the decoded artifact before it is returned and cached.
    pub editor: Option<Arc<dyn Editor>>,
    /// Receives download progress.
    pub progress: Option<mpsc::UnboundedSender<LoadProgress>>,
}

impl LoadRequest {
    /// Creates a request with default options.
    #[must_use]
    pub const fn new(resource: Resource) -> Self {
        Self {
            resource,
            options: LoadOptions::empty(),
            editor: None,
            progress: None,
        }
    }

    /// Sets the behavior flags.
    #[must_use]
    pub const fn with_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the editor.
    #[must_use]
    pub fn with_editor(mut self, editor: Arc<dyn Editor>) -> Self {
        self.editor = Some(editor);
        self
    }

    /// Forwards download progress to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<LoadProgress>) -> Self {
        self.progress = Some(progress);
        self
    }
}

impl std::fmt::Debug for LoadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadRequest")
            .field("resource", &self.resource)
            .field("options", &self.options)
            .field("editor", &self.editor.as_ref().map(|e| e.key()))
            .finish_non_exhaustive()
    }
}

/// A successful load.
#[derive(Debug, Clone)]
pub struct LoadedArtifact {
    /// Decoded artifact. None for preload-only loads that stopped at raw bytes.
    pub artifact: Option<Artifact>,
    /// Raw bytes, when the load read or downloaded them.
    pub data: Option<Bytes>,
    /// Where the result came from.
    pub tier: Tier,
}

impl LoadedArtifact {
    /// Creates a result.
    #[must_use]
    pub const fn new(artifact: Option<Artifact>, data: Option<Bytes>, tier: Tier) -> Self {
        Self {
            artifact,
            data,
            tier,
        }
    }
}

/// Outcome delivered to the caller of a load.
pub type LoadOutcome = Result<LoadedArtifact, LoadError>;

/// Running totals of a preload batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PreloadProgress {
    /// Loads that succeeded.
    pub success: usize,
    /// Loads that completed, successfully or not. Cancelled loads never complete.
    pub finished: usize,
    /// Loads in the batch.
    pub total: usize,
}
