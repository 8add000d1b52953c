//! Application layer with the load manager and its DTOs.

/// Data transfer objects.
pub mod dto;
/// Tiered load orchestration.
pub mod load_manager;
/// Process-wide default manager.
pub mod shared;

pub use dto::{LoadOutcome, LoadProgress, LoadRequest, LoadedArtifact, PreloadProgress};
pub use load_manager::{LoadHandle, LoadManager, LoadTask, LoadTaskId, PreloadBatch};
