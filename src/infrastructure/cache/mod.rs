//! Cache tiers.
//!
//! - In-memory LRU with cost, count and age limits
//! - SQLite-indexed disk store with inline and file-backed entries
//! - A facade that queries and stores across both

pub mod disk_store;
pub mod facade;
pub mod memory_cache;

pub use disk_store::{DiskStore, DiskStoreConfig};
pub use facade::{CacheFacade, QueryResult};
pub use memory_cache::{CacheStats, MemoryCache, MemoryCacheConfig};
