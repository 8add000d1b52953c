//! Memory and disk tiers behind one query/store/remove/clear API.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use image::ImageFormat;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::disk_store::{DiskStore, DiskStoreConfig};
use super::memory_cache::{MemoryCache, MemoryCacheConfig};
use crate::domain::entities::{Artifact, CacheKey, CacheType, LifecycleEvent};
use crate::domain::errors::StorageResult;
use crate::domain::ports::Decoder;

/// What a query found.
#[derive(Debug, Clone)]
pub enum QueryResult {
    /// Nothing in the requested tiers.
    None,
    /// Decoded artifact from memory.
    Memory(Artifact),
    /// Raw bytes from disk.
    Disk(Bytes),
    /// Both, when both tiers were requested and both hit.
    All(Artifact, Bytes),
}

impl QueryResult {
    /// The artifact, if the memory tier hit.
    #[must_use]
    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            Self::Memory(artifact) | Self::All(artifact, _) => Some(artifact),
            Self::None | Self::Disk(_) => None,
        }
    }

    /// The raw bytes, if the disk tier hit.
    #[must_use]
    pub fn data(&self) -> Option<&Bytes> {
        match self {
            Self::Disk(data) | Self::All(_, data) => Some(data),
            Self::None | Self::Memory(_) => None,
        }
    }
}

/// The two cache tiers. The disk tier is optional: if it fails to open, the
/// facade keeps serving memory and reports why disk is missing.
pub struct CacheFacade {
    memory: MemoryCache<Artifact>,
    disk: Option<Arc<DiskStore>>,
    disk_error: Option<String>,
    encoder: Arc<dyn Decoder>,
    auto_trim: Option<JoinHandle<()>>,
}

impl CacheFacade {
    /// Builds the facade over an already opened (or failed) disk store.
    #[must_use]
    pub fn new(
        memory: MemoryCacheConfig,
        disk: StorageResult<DiskStore>,
        encoder: Arc<dyn Decoder>,
    ) -> Self {
        let (disk, disk_error) = match disk {
            Ok(store) => (Some(Arc::new(store)), None),
            Err(e) => {
                warn!(error = %e, "disk tier disabled");
                (None, Some(e.to_string()))
            }
        };
        let auto_trim = match (&disk, tokio::runtime::Handle::try_current()) {
            (Some(store), Ok(_)) => Some(store.start_auto_trim()),
            _ => None,
        };
        Self {
            memory: MemoryCache::new(memory),
            disk,
            disk_error,
            encoder,
            auto_trim,
        }
    }

    /// Opens the disk tier under `root` and builds the facade.
    #[must_use]
    pub fn open(
        root: impl Into<PathBuf>,
        memory: MemoryCacheConfig,
        disk: DiskStoreConfig,
        encoder: Arc<dyn Decoder>,
    ) -> Self {
        Self::new(memory, DiskStore::open(root, disk), encoder)
    }

    /// Memory tier.
    #[must_use]
    pub fn memory(&self) -> &MemoryCache<Artifact> {
        &self.memory
    }

    /// Disk tier, if it opened.
    #[must_use]
    pub fn disk(&self) -> Option<&Arc<DiskStore>> {
        self.disk.as_ref()
    }

    /// Why the disk tier is missing, if it is.
    #[must_use]
    pub fn disk_error(&self) -> Option<&str> {
        self.disk_error.as_deref()
    }

    /// Runs `op` against the disk tier on the blocking pool. Disk failures are
    /// logged and reported as None.
    async fn with_disk<T, F>(&self, op: &'static str, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&DiskStore) -> StorageResult<T> + Send + 'static,
    {
        let store = Arc::clone(self.disk.as_ref()?);
        match tokio::task::spawn_blocking(move || f(&store)).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!(op, error = %e, "disk tier operation failed");
                None
            }
            Err(e) => {
                tracing::error!(op, error = %e, "disk tier task panicked");
                None
            }
        }
    }

    /// Looks `key` up in the requested tiers.
    pub async fn query(&self, key: &CacheKey, cache_type: CacheType) -> QueryResult {
        let mut memory_hit = None;
        if cache_type.contains(CacheType::MEMORY)
            && let Some(artifact) = self.memory.get(key)
        {
            if cache_type == CacheType::ALL {
                memory_hit = Some(artifact);
            } else {
                return QueryResult::Memory(artifact);
            }
        }

        if cache_type.contains(CacheType::DISK) && self.disk.is_some() {
            let lookup = key.clone();
            let data = self
                .with_disk("get", move |store| store.get(&lookup))
                .await
                .flatten();
            return match (memory_hit, data) {
                (Some(artifact), Some(data)) => QueryResult::All(artifact, Bytes::from(data)),
                (None, Some(data)) => QueryResult::Disk(Bytes::from(data)),
                (Some(artifact), None) => QueryResult::Memory(artifact),
                (None, None) => QueryResult::None,
            };
        }

        match memory_hit {
            Some(artifact) => QueryResult::Memory(artifact),
            None => QueryResult::None,
        }
    }

    /// Returns true if the disk tier has an entry for `key`.
    pub async fn contains_on_disk(&self, key: &CacheKey) -> bool {
        let lookup = key.clone();
        self.with_disk("exists", move |store| store.exists(&lookup))
            .await
            .unwrap_or(false)
    }

    /// Stores into the requested tiers. The memory tier takes `artifact`; the
    /// disk tier takes `data`, or the encoded `artifact` when `data` is None.
    pub async fn store(
        &self,
        key: &CacheKey,
        artifact: Option<Artifact>,
        data: Option<Bytes>,
        cache_type: CacheType,
    ) {
        if cache_type.contains(CacheType::MEMORY)
            && let Some(artifact) = &artifact
        {
            self.memory
                .put(key.clone(), artifact.clone(), artifact.cost().max(1));
        }

        if !cache_type.contains(CacheType::DISK) || self.disk.is_none() {
            return;
        }
        let data = match data {
            Some(data) => Some(data),
            None => match artifact {
                Some(artifact) => self.encode(artifact).await,
                None => None,
            },
        };
        let Some(data) = data else {
            trace!(key = %key, "nothing to write to disk");
            return;
        };
        let target = key.clone();
        self.with_disk("put", move |store| store.put(&target, &data))
            .await;
    }

    async fn encode(&self, artifact: Artifact) -> Option<Bytes> {
        match artifact {
            Artifact::Animated(animated) => Some(animated.original_data().clone()),
            Artifact::Still(image) => {
                let encoder = Arc::clone(&self.encoder);
                let format = image.format.unwrap_or(ImageFormat::Png);
                let encoded = tokio::task::spawn_blocking(move || {
                    if encoder.can_encode(format) {
                        encoder.encode(&image, format)
                    } else {
                        encoder.encode(&image, ImageFormat::Png)
                    }
                })
                .await
                .ok()
                .flatten();
                if encoded.is_none() {
                    debug!(?format, "artifact could not be encoded for disk");
                }
                encoded.map(Bytes::from)
            }
        }
    }

    /// Removes `key` from the requested tiers.
    pub async fn remove(&self, key: &CacheKey, cache_type: CacheType) {
        if cache_type.contains(CacheType::MEMORY) {
            self.memory.remove(key);
        }
        if cache_type.contains(CacheType::DISK) {
            let target = key.clone();
            self.with_disk("remove", move |store| store.remove(&target))
                .await;
        }
    }

    /// Empties the requested tiers.
    pub async fn clear(&self, cache_type: CacheType) {
        if cache_type.contains(CacheType::MEMORY) {
            self.memory.clear();
        }
        if cache_type.contains(CacheType::DISK) {
            self.with_disk("clear", DiskStore::clear).await;
        }
    }

    /// Disk tier entry count and total size, if the disk tier is available.
    pub async fn disk_usage(&self) -> Option<(u64, u64)> {
        self.with_disk("stats", |store| {
            Ok((store.total_count()?, store.total_size()?))
        })
        .await
    }

    /// Clears the memory tier on memory pressure or backgrounding.
    pub fn handle_lifecycle(&self, event: LifecycleEvent) {
        self.memory.handle_lifecycle(event);
    }
}

impl Drop for CacheFacade {
    fn drop(&mut self) {
        if let Some(task) = self.auto_trim.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for CacheFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFacade")
            .field("memory", &self.memory.stats())
            .field("disk", &self.disk)
            .field("disk_error", &self.disk_error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::DecodedImage;
    use crate::domain::errors::StorageError;
    use crate::infrastructure::codec::ImageCodec;
    use image::DynamicImage;
    use tempfile::TempDir;

    fn facade(dir: &TempDir) -> CacheFacade {
        CacheFacade::open(
            dir.path(),
            MemoryCacheConfig::default(),
            DiskStoreConfig::default(),
            Arc::new(ImageCodec::new()),
        )
    }

    fn artifact() -> Artifact {
        Artifact::from(DecodedImage::new(
            DynamicImage::new_rgba8(2, 2),
            Some(ImageFormat::Png),
        ))
    }

    #[tokio::test]
    async fn test_store_all_then_query_all() {
        let dir = TempDir::new().unwrap();
        let cache = facade(&dir);
        let key = CacheKey::new("k");
        let data = Bytes::from_static(b"raw bytes");

        cache
            .store(&key, Some(artifact()), Some(data.clone()), CacheType::ALL)
            .await;

        match cache.query(&key, CacheType::ALL).await {
            QueryResult::All(found, bytes) => {
                assert_eq!(found.dimensions(), (2, 2));
                assert_eq!(bytes, data);
            }
            other => panic!("expected both tiers, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tiers_are_independent() {
        let dir = TempDir::new().unwrap();
        let cache = facade(&dir);
        let key = CacheKey::new("k");
        let data = Bytes::from_static(b"payload");
        cache
            .store(&key, Some(artifact()), Some(data.clone()), CacheType::ALL)
            .await;

        cache.remove(&key, CacheType::MEMORY).await;
        assert!(matches!(
            cache.query(&key, CacheType::ALL).await,
            QueryResult::Disk(ref bytes) if *bytes == data
        ));

        cache
            .store(&key, Some(artifact()), None, CacheType::MEMORY)
            .await;
        cache.remove(&key, CacheType::DISK).await;
        assert!(matches!(
            cache.query(&key, CacheType::ALL).await,
            QueryResult::Memory(_)
        ));
        assert!(!cache.contains_on_disk(&key).await);
    }

    #[tokio::test]
    async fn test_memory_only_query_skips_disk() {
        let dir = TempDir::new().unwrap();
        let cache = facade(&dir);
        let key = CacheKey::new("k");
        cache
            .store(&key, None, Some(Bytes::from_static(b"x")), CacheType::DISK)
            .await;
        assert!(matches!(
            cache.query(&key, CacheType::MEMORY).await,
            QueryResult::None
        ));
        assert!(cache.contains_on_disk(&key).await);
    }

    #[tokio::test]
    async fn test_store_without_bytes_encodes_artifact() {
        let dir = TempDir::new().unwrap();
        let cache = facade(&dir);
        let key = CacheKey::new("encoded");
        cache
            .store(&key, Some(artifact()), None, CacheType::DISK)
            .await;

        let QueryResult::Disk(bytes) = cache.query(&key, CacheType::DISK).await else {
            panic!("encoded bytes missing");
        };
        assert!(image::load_from_memory(&bytes).is_ok());
    }

    #[tokio::test]
    async fn test_clear_and_usage() {
        let dir = TempDir::new().unwrap();
        let cache = facade(&dir);
        for name in ["a", "b"] {
            cache
                .store(
                    &CacheKey::new(name),
                    Some(artifact()),
                    Some(Bytes::from_static(b"1234")),
                    CacheType::ALL,
                )
                .await;
        }
        assert_eq!(cache.disk_usage().await, Some((2, 8)));

        cache.clear(CacheType::ALL).await;
        assert_eq!(cache.disk_usage().await, Some((0, 0)));
        assert_eq!(cache.memory().total_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_disk_tier_degrades_to_memory() {
        let cache = CacheFacade::new(
            MemoryCacheConfig::default(),
            Err(StorageError::unavailable("/nowhere", "denied")),
            Arc::new(ImageCodec::new()),
        );
        let key = CacheKey::new("k");
        cache
            .store(&key, Some(artifact()), Some(Bytes::from_static(b"x")), CacheType::ALL)
            .await;

        assert!(cache.disk_error().is_some());
        assert!(matches!(
            cache.query(&key, CacheType::ALL).await,
            QueryResult::Memory(_)
        ));
        assert!(!cache.contains_on_disk(&key).await);
        assert_eq!(cache.disk_usage().await, None);
    }
}
