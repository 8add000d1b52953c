//! Infrastructure layer with cache tiers and external service adapters.

/// Memory and disk cache tiers.
pub mod cache;
/// Default image codec.
pub mod codec;
/// Application configuration.
pub mod config;
/// Network fetch layer.
pub mod download;
/// Operating system memory probe.
pub mod system_memory;

pub use cache::{
    CacheFacade, CacheStats, DiskStore, DiskStoreConfig, MemoryCache, MemoryCacheConfig,
    QueryResult,
};
pub use codec::ImageCodec;
pub use config::{AppConfig, CliArgs, ConfigLoader, LogLevel};
pub use download::{DownloadEvent, DownloadTask, Downloader, DownloaderConfig, HttpTransport};
pub use system_memory::SystemMemory;
