//! Domain entity definitions.

mod animated_artifact;
mod artifact;
mod cache_key;
mod options;

pub use animated_artifact::{AnimatedArtifact, EvictionOrder, ViewerId};
pub use artifact::{Artifact, CacheType, DecodedImage, Tier};
pub use cache_key::{CacheKey, Resource};
pub use options::{LifecycleEvent, LoadOptions};
