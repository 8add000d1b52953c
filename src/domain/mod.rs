//! Domain layer with cache entities, error taxonomy and port definitions.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;

pub use entities::{Artifact, CacheKey, CacheType, LoadOptions, Resource, Tier};
pub use errors::{LoadError, StorageError, TransportError};
