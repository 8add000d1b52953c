//! Load behavior flags and process lifecycle signals.

bitflags::bitflags! {
    /// Controls how a single load walks the cache tiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
    pub struct LoadOptions: u32 {
        /// Read raw bytes from disk even when the memory tier already has the artifact.
        const QUERY_DATA_WHEN_IN_MEMORY = 1 << 0;
        /// Never read or write the disk tier.
        const IGNORE_DISK_CACHE = 1 << 1;
        /// Skip every cache lookup and download again.
        const REFRESH_CACHE = 1 << 2;
        /// Download even if the URL is blacklisted; a success clears the entry.
        const RETRY_FAILED_URL = 1 << 3;
        /// Deliver partially decoded images while bytes arrive.
        const PROGRESSIVE_DOWNLOAD = 1 << 4;
        /// Skip the decompress step after decoding.
        const IGNORE_IMAGE_DECODING = 1 << 5;
        /// Only make sure the raw bytes are on disk; never decode, edit, or
        /// populate the memory tier.
        const PRELOAD = 1 << 6;
    }
}

/// Process-level signals the caches react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The system is short on memory.
    MemoryWarning,
    /// The process moved to the background.
    EnteredBackground,
    /// The process returned to the foreground.
    BecameActive,
}

impl LifecycleEvent {
    /// Returns true if caches should drop what they hold.
    #[must_use]
    pub const fn releases_memory(self) -> bool {
        matches!(self, Self::MemoryWarning | Self::EnteredBackground)
    }
}
