//! Decoded artifacts and cache tier descriptors.

use std::sync::Arc;

use image::{DynamicImage, ImageFormat};

use super::animated_artifact::AnimatedArtifact;

/// A decoded still image together with the format it came from and the key
/// of the edit applied to it, if any.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    /// Pixel data.
    pub image: DynamicImage,
    /// Source container format, when known.
    pub format: Option<ImageFormat>,
    /// Key of the editor whose output this is. `None` for raw decoder output.
    pub edit_key: Option<String>,
}

impl DecodedImage {
    /// Wraps raw decoder output.
    #[must_use]
    pub const fn new(image: DynamicImage, format: Option<ImageFormat>) -> Self {
        Self {
            image,
            format,
            edit_key: None,
        }
    }

    /// Marks this image as produced by the editor identified by `key`.
    #[must_use]
    pub fn with_edit_key(mut self, key: impl Into<String>) -> Self {
        self.edit_key = Some(key.into());
        self
    }

    /// Size of the pixel buffer in bytes.
    #[must_use]
    pub fn byte_cost(&self) -> u64 {
        self.image.as_bytes().len() as u64
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// What the memory tier holds for a key.
#[derive(Debug, Clone)]
pub enum Artifact {
    /// Single-frame image.
    Still(Arc<DecodedImage>),
    /// Multi-frame image with its own frame cache.
    Animated(Arc<AnimatedArtifact>),
}

impl Artifact {
    /// Memory cost charged to the memory tier.
    ///
    /// Animated artifacts are charged for their first frame; the rest of
    /// their frames are governed by their own budget.
    #[must_use]
    pub fn cost(&self) -> u64 {
        match self {
            Self::Still(image) => image.byte_cost(),
            Self::Animated(animated) => animated.poster().byte_cost(),
        }
    }

    /// Edit key of a still image. Animated artifacts track edits per frame.
    #[must_use]
    pub fn edit_key(&self) -> Option<&str> {
        match self {
            Self::Still(image) => image.edit_key.as_deref(),
            Self::Animated(_) => None,
        }
    }

    /// Returns the still image, if this is one.
    #[must_use]
    pub fn as_still(&self) -> Option<&Arc<DecodedImage>> {
        match self {
            Self::Still(image) => Some(image),
            Self::Animated(_) => None,
        }
    }

    /// Returns the animated artifact, if this is one.
    #[must_use]
    pub fn as_animated(&self) -> Option<&Arc<AnimatedArtifact>> {
        match self {
            Self::Animated(animated) => Some(animated),
            Self::Still(_) => None,
        }
    }

    /// Pixel dimensions of the still image or of the first frame.
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Still(image) => (image.width(), image.height()),
            Self::Animated(animated) => {
                let poster = animated.poster();
                (poster.width(), poster.height())
            }
        }
    }
}

impl From<DecodedImage> for Artifact {
    fn from(image: DecodedImage) -> Self {
        Self::Still(Arc::new(image))
    }
}

bitflags::bitflags! {
    /// Selects which tiers an operation touches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
    pub struct CacheType: u8 {
        /// In-process memory tier.
        const MEMORY = 1 << 0;
        /// Persistent disk tier.
        const DISK = 1 << 1;
        /// Both tiers.
        const ALL = Self::MEMORY.bits() | Self::DISK.bits();
    }
}

/// Where a load result was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Downloaded; no cache tier held it.
    Network,
    /// Served from the memory tier.
    Memory,
    /// Raw bytes came from the disk tier.
    Disk,
    /// Artifact was in memory and its raw bytes were read from disk.
    MemoryAndDisk,
}

impl Tier {
    /// The cache tiers this provenance represents.
    #[must_use]
    pub const fn cache_type(self) -> CacheType {
        match self {
            Self::Network => CacheType::empty(),
            Self::Memory => CacheType::MEMORY,
            Self::Disk => CacheType::DISK,
            Self::MemoryAndDisk => CacheType::ALL,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Memory => write!(f, "memory"),
            Self::Disk => write!(f, "disk"),
            Self::MemoryAndDisk => write!(f, "memory+disk"),
        }
    }
}
