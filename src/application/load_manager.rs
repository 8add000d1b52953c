//! Load orchestration across memory, disk and network.
//!
//! A load walks the tiers in order: blacklist, memory, disk, network. Results
//! are stored back into the tiers the load did not get them from.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::application::dto::{
    LoadOutcome, LoadProgress, LoadRequest, LoadedArtifact, PreloadProgress,
};
use crate::domain::entities::{
    AnimatedArtifact, Artifact, CacheKey, CacheType, DecodedImage, LifecycleEvent, LoadOptions,
    Resource, Tier,
};
use crate::domain::errors::{LoadError, StorageError, TransportError};
use crate::domain::ports::{Codecs, Editor, MemoryProbe, apply_edit};
use crate::infrastructure::cache::{CacheFacade, DiskStore, QueryResult};
use crate::infrastructure::codec::ImageCodec;
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::download::{DownloadEvent, Downloader, HttpTransport, TaskHandle};
use crate::infrastructure::system_memory::SystemMemory;

const LIFECYCLE_CAPACITY: usize = 16;

/// Identifier of one load.
pub type LoadTaskId = u64;

/// Cancellation handle of one load.
#[derive(Clone)]
pub struct LoadTask {
    id: LoadTaskId,
    token: CancellationToken,
    manager: Weak<Inner>,
}

impl LoadTask {
    /// Task id.
    #[must_use]
    pub const fn id(&self) -> LoadTaskId {
        self.id
    }

    /// Returns true once the load was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancels the load and its download. A cancelled load never delivers an
    /// outcome. Cache writes already made stay.
    pub fn cancel(&self) {
        match self.manager.upgrade() {
            Some(inner) => inner.cancel_task(self.id),
            None => self.token.cancel(),
        }
    }
}

impl std::fmt::Debug for LoadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadTask")
            .field("id", &self.id)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// A running load: its cancellation handle and its eventual outcome.
#[derive(Debug)]
pub struct LoadHandle {
    task: LoadTask,
    outcome: oneshot::Receiver<LoadOutcome>,
}

impl LoadHandle {
    /// Cancellation handle.
    #[must_use]
    pub const fn task(&self) -> &LoadTask {
        &self.task
    }

    /// Cancels the load.
    pub fn cancel(&self) {
        self.task.cancel();
    }

    /// Waits for the outcome. None if the load was cancelled.
    pub async fn outcome(self) -> Option<LoadOutcome> {
        self.outcome.await.ok()
    }
}

/// Loads issued by one [`LoadManager::preload`] call.
#[derive(Debug)]
pub struct PreloadBatch {
    tasks: Vec<LoadTask>,
    summary: JoinHandle<PreloadProgress>,
}

impl PreloadBatch {
    /// Cancellation handles, one per resource.
    #[must_use]
    pub fn tasks(&self) -> &[LoadTask] {
        &self.tasks
    }

    /// Waits until every load completed or was cancelled and returns the totals.
    pub async fn finished(self) -> PreloadProgress {
        match self.summary.await {
            Ok(summary) => summary,
            Err(e) => {
                error!(error = %e, "preload summary task failed");
                PreloadProgress {
                    total: self.tasks.len(),
                    ..PreloadProgress::default()
                }
            }
        }
    }
}

struct TaskEntry {
    token: CancellationToken,
    download: Option<TaskHandle>,
}

#[derive(Default)]
struct TaskRegistry {
    tasks: HashMap<LoadTaskId, TaskEntry>,
    preload: HashSet<LoadTaskId>,
}

struct Inner {
    cache: CacheFacade,
    downloader: Downloader,
    codecs: Codecs,
    probe: Arc<dyn MemoryProbe>,
    registry: Mutex<TaskRegistry>,
    blacklist: Mutex<HashSet<Url>>,
    next_task: AtomicU64,
    lifecycle: broadcast::Sender<LifecycleEvent>,
}

/// Per-load state threaded through the tiers.
struct LoadContext {
    id: LoadTaskId,
    token: CancellationToken,
    resource: Resource,
    options: LoadOptions,
    editor: Option<Arc<dyn Editor>>,
    progress: Option<mpsc::UnboundedSender<LoadProgress>>,
}

impl LoadContext {
    fn key(&self) -> &CacheKey {
        &self.resource.cache_key
    }

    fn url(&self) -> &Url {
        &self.resource.url
    }
}

/// What the memory tier can do for a load.
enum MemoryHit {
    Serve,
    Edit(Arc<DecodedImage>, Arc<dyn Editor>),
    Miss,
}

/// Coordinates the cache tiers and the downloader.
pub struct LoadManager {
    inner: Arc<Inner>,
}

impl LoadManager {
    /// Creates a manager over the given tiers and collaborators.
    #[must_use]
    pub fn new(
        cache: CacheFacade,
        downloader: Downloader,
        codecs: Codecs,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                cache,
                downloader,
                codecs,
                probe,
                registry: Mutex::new(TaskRegistry::default()),
                blacklist: Mutex::new(HashSet::new()),
                next_task: AtomicU64::new(1),
                lifecycle,
            }),
        }
    }

    /// Builds a manager with the default collaborators: reqwest transport,
    /// `image` codec and the OS memory probe. If the disk tier cannot be
    /// opened, the manager runs memory-only.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn from_config(config: &AppConfig) -> Result<Self, TransportError> {
        let codec = Arc::new(ImageCodec::new());
        let disk = match config.effective_cache_dir() {
            Some(dir) => DiskStore::open(dir, config.disk_store_config()),
            None => Err(StorageError::unavailable("", "no cache directory available")),
        };
        let cache = CacheFacade::new(config.memory_cache_config(), disk, codec.clone());
        let codecs = Codecs::new(codec.clone())
            .with_progressive(codec.clone())
            .with_animated(codec);
        let downloader = Downloader::new(
            config.downloader_config(),
            Arc::new(HttpTransport::new()?),
            codecs.progressive().cloned(),
        );
        info!(
            disk = cache.disk().is_some(),
            max_concurrent = downloader.max_concurrent_downloads(),
            "load manager ready"
        );
        Ok(Self::new(cache, downloader, codecs, Arc::new(SystemMemory::new())))
    }

    /// Cache tiers.
    #[must_use]
    pub fn cache(&self) -> &CacheFacade {
        &self.inner.cache
    }

    /// Downloader.
    #[must_use]
    pub fn downloader(&self) -> &Downloader {
        &self.inner.downloader
    }

    /// Decode collaborators.
    #[must_use]
    pub fn codecs(&self) -> &Codecs {
        &self.inner.codecs
    }

    /// Starts a load. Must be called within a Tokio runtime.
    pub fn load(&self, request: LoadRequest) -> LoadHandle {
        self.inner.start(request)
    }

    /// Loads `resource` with `options` and waits for the outcome.
    /// None if the load was cancelled.
    pub async fn fetch(&self, resource: Resource, options: LoadOptions) -> Option<LoadOutcome> {
        self.load(LoadRequest::new(resource).with_options(options))
            .outcome()
            .await
    }

    /// Makes sure the raw bytes of each resource are on disk without decoding
    /// them or touching the memory tier. Cancels any earlier preloads first.
    /// Running totals go to `progress` after each completed load.
    pub fn preload(
        &self,
        resources: impl IntoIterator<Item = Resource>,
        progress: Option<mpsc::UnboundedSender<PreloadProgress>>,
    ) -> PreloadBatch {
        self.cancel_preloading();
        let handles: Vec<LoadHandle> = resources
            .into_iter()
            .map(|resource| {
                self.load(LoadRequest::new(resource).with_options(LoadOptions::PRELOAD))
            })
            .collect();
        let total = handles.len();
        let tasks = handles.iter().map(|handle| handle.task().clone()).collect();
        debug!(total, "preload batch started");

        let summary = tokio::spawn(async move {
            let mut pending: FuturesUnordered<_> =
                handles.into_iter().map(LoadHandle::outcome).collect();
            let mut totals = PreloadProgress {
                total,
                ..PreloadProgress::default()
            };
            while let Some(outcome) = pending.next().await {
                let Some(outcome) = outcome else {
                    continue;
                };
                totals.finished += 1;
                if outcome.is_ok() {
                    totals.success += 1;
                }
                if let Some(progress) = &progress {
                    let _ = progress.send(totals);
                }
            }
            debug!(success = totals.success, total, "preload batch finished");
            totals
        });

        PreloadBatch { tasks, summary }
    }

    /// Cancels every preload.
    pub fn cancel_preloading(&self) {
        let ids: Vec<_> = self.inner.registry.lock().preload.iter().copied().collect();
        for id in ids {
            self.inner.cancel_task(id);
        }
    }

    /// Cancels every load.
    pub fn cancel_all(&self) {
        let ids: Vec<_> = self.inner.registry.lock().tasks.keys().copied().collect();
        for id in ids {
            self.inner.cancel_task(id);
        }
    }

    /// Loads in progress.
    #[must_use]
    pub fn current_task_count(&self) -> usize {
        self.inner.registry.lock().tasks.len()
    }

    /// Preloads in progress.
    #[must_use]
    pub fn current_preload_task_count(&self) -> usize {
        self.inner.registry.lock().preload.len()
    }

    /// Returns true if loads of `url` fail fast.
    #[must_use]
    pub fn is_blacklisted(&self, url: &Url) -> bool {
        self.inner.blacklist.lock().contains(url)
    }

    /// Forgets every failed URL.
    pub fn clear_blacklist(&self) {
        self.inner.blacklist.lock().clear();
    }

    /// Applies a lifecycle signal: the memory tier clears on memory pressure
    /// or backgrounding, and every subscriber (including animated artifacts
    /// handed out by this manager) is notified.
    pub fn notify(&self, event: LifecycleEvent) {
        info!(?event, "lifecycle event");
        self.inner.cache.handle_lifecycle(event);
        let _ = self.inner.lifecycle.send(event);
    }

    /// Receives every signal passed to [`Self::notify`].
    #[must_use]
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.lifecycle.subscribe()
    }
}

impl std::fmt::Debug for LoadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadManager")
            .field("cache", &self.inner.cache)
            .field("downloader", &self.inner.downloader)
            .field("tasks", &self.current_task_count())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn start(self: &Arc<Self>, request: LoadRequest) -> LoadHandle {
        let id = self.next_task.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        {
            let mut registry = self.registry.lock();
            registry.tasks.insert(
                id,
                TaskEntry {
                    token: token.clone(),
                    download: None,
                },
            );
            if request.options.contains(LoadOptions::PRELOAD) {
                registry.preload.insert(id);
            }
        }

        let ctx = LoadContext {
            id,
            token: token.clone(),
            resource: request.resource,
            options: request.options,
            editor: request.editor,
            progress: request.progress,
        };
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                () = ctx.token.cancelled() => None,
                outcome = inner.execute(&ctx) => outcome,
            };
            inner.forget(ctx.id);
            if let Some(outcome) = outcome
                && !ctx.token.is_cancelled()
            {
                let _ = tx.send(outcome);
            } else {
                trace!(task = ctx.id, "load cancelled");
            }
        });

        LoadHandle {
            task: LoadTask {
                id,
                token,
                manager: Arc::downgrade(self),
            },
            outcome: rx,
        }
    }

    /// Runs one load. None means it was cancelled.
    async fn execute(self: &Arc<Self>, ctx: &LoadContext) -> Option<LoadOutcome> {
        if !ctx.options.contains(LoadOptions::RETRY_FAILED_URL)
            && self.blacklist.lock().contains(ctx.url())
        {
            debug!(url = %ctx.url(), "url is blacklisted");
            return Some(Err(LoadError::blacklisted(ctx.url().as_str())));
        }

        if ctx.options.contains(LoadOptions::REFRESH_CACHE) {
            return self.download(ctx, ctx.options).await;
        }

        let in_memory = self
            .cache
            .query(ctx.key(), CacheType::MEMORY)
            .await
            .artifact()
            .cloned();
        if let Some(artifact) = &in_memory {
            match Self::memory_hit(ctx, artifact) {
                MemoryHit::Serve => {
                    trace!(key = %ctx.key(), tier = %Tier::Memory, "load served");
                    return Some(Ok(LoadedArtifact::new(
                        Some(artifact.clone()),
                        None,
                        Tier::Memory,
                    )));
                }
                MemoryHit::Edit(image, editor) => {
                    return self.edit_in_memory(ctx, image, editor).await;
                }
                MemoryHit::Miss => {}
            }
        }

        if ctx.options.contains(LoadOptions::IGNORE_DISK_CACHE) || ctx.resource.is_file() {
            return self
                .download(ctx, ctx.options | LoadOptions::IGNORE_DISK_CACHE)
                .await;
        }

        if ctx.options.contains(LoadOptions::PRELOAD) {
            if let Some(reason) = self.cache.disk_error() {
                return Some(Err(LoadError::storage_unavailable(reason)));
            }
            if self.cache.contains_on_disk(ctx.key()).await {
                trace!(key = %ctx.key(), "preload already on disk");
                return Some(Ok(LoadedArtifact::new(None, None, Tier::Disk)));
            }
            return self.download(ctx, ctx.options).await;
        }

        match self.cache.query(ctx.key(), CacheType::DISK).await {
            QueryResult::Disk(data) | QueryResult::All(_, data) => {
                if ctx.token.is_cancelled() {
                    return None;
                }
                let tier = if in_memory.is_some() {
                    Tier::MemoryAndDisk
                } else {
                    Tier::Disk
                };
                self.handle_data(ctx, ctx.options, data, tier).await
            }
            QueryResult::None | QueryResult::Memory(_) => self.download(ctx, ctx.options).await,
        }
    }

    fn memory_hit(ctx: &LoadContext, artifact: &Artifact) -> MemoryHit {
        if ctx.options.contains(LoadOptions::PRELOAD) {
            return MemoryHit::Serve;
        }
        if ctx.options.contains(LoadOptions::QUERY_DATA_WHEN_IN_MEMORY) {
            return MemoryHit::Miss;
        }
        let image = match artifact {
            Artifact::Animated(animated) => {
                animated.set_editor(ctx.editor.clone());
                return MemoryHit::Serve;
            }
            Artifact::Still(image) => image,
        };
        match (&ctx.editor, image.edit_key.as_deref()) {
            (Some(editor), Some(key)) if key == editor.key() => MemoryHit::Serve,
            (Some(editor), None) => MemoryHit::Edit(Arc::clone(image), Arc::clone(editor)),
            (None, None) => MemoryHit::Serve,
            _ => MemoryHit::Miss,
        }
    }

    async fn edit_in_memory(
        &self,
        ctx: &LoadContext,
        image: Arc<DecodedImage>,
        editor: Arc<dyn Editor>,
    ) -> Option<LoadOutcome> {
        let key = editor.key();
        let edited = tokio::task::spawn_blocking(move || apply_edit(editor.as_ref(), &image))
            .await
            .unwrap_or_else(|e| {
                error!(error = %e, "edit task panicked");
                None
            });
        if ctx.token.is_cancelled() {
            return None;
        }
        let Some(edited) = edited else {
            warn!(key = %ctx.key(), editor = %key, "edit produced nothing");
            return Some(Err(LoadError::edit_failed(key)));
        };
        let artifact = Artifact::from(edited);
        self.cache
            .store(ctx.key(), Some(artifact.clone()), None, CacheType::MEMORY)
            .await;
        Some(Ok(LoadedArtifact::new(Some(artifact), None, Tier::Memory)))
    }

    async fn download(
        self: &Arc<Self>,
        ctx: &LoadContext,
        options: LoadOptions,
    ) -> Option<LoadOutcome> {
        let mut task = self.downloader.download(ctx.url(), options);
        let handle = task.handle();
        if !self.attach_download(ctx.id, handle.clone()) {
            self.downloader.cancel(&handle);
            return None;
        }

        let result = loop {
            match task.next_event().await? {
                DownloadEvent::Progress {
                    received,
                    expected,
                    partial,
                } => {
                    if let Some(progress) = &ctx.progress
                        && !ctx.token.is_cancelled()
                    {
                        let _ = progress.send(LoadProgress {
                            received,
                            expected,
                            partial,
                        });
                    }
                }
                DownloadEvent::Finished(result) => break result,
            }
        };
        if ctx.token.is_cancelled() {
            return None;
        }

        match result {
            Ok(data) => {
                if options.contains(LoadOptions::RETRY_FAILED_URL)
                    && self.blacklist.lock().remove(ctx.url())
                {
                    info!(url = %ctx.url(), "url removed from blacklist");
                }
                self.handle_data(ctx, options, data, Tier::Network).await
            }
            Err(e) => {
                if e.blacklists_url() {
                    self.add_to_blacklist(ctx.url());
                }
                Some(Err(e))
            }
        }
    }

    async fn handle_data(
        self: &Arc<Self>,
        ctx: &LoadContext,
        options: LoadOptions,
        data: Bytes,
        tier: Tier,
    ) -> Option<LoadOutcome> {
        if options.contains(LoadOptions::PRELOAD) {
            if tier == Tier::Network && !options.contains(LoadOptions::IGNORE_DISK_CACHE) {
                self.cache
                    .store(ctx.key(), None, Some(data.clone()), CacheType::DISK)
                    .await;
            }
            return Some(Ok(LoadedArtifact::new(None, Some(data), tier)));
        }

        let inner = Arc::clone(self);
        let editor = ctx.editor.clone();
        let raw = data.clone();
        let decompress = !options.contains(LoadOptions::IGNORE_IMAGE_DECODING);
        let decoded = tokio::task::spawn_blocking(move || {
            inner.decode_artifact(&raw, editor.as_ref(), decompress)
        })
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "decode task panicked");
            Err(LoadError::InvalidData)
        });
        if ctx.token.is_cancelled() {
            return None;
        }

        match decoded {
            Ok(artifact) => {
                if let Artifact::Animated(animated) = &artifact {
                    animated.watch_lifecycle(self.lifecycle.subscribe());
                }
                let store = if tier == Tier::Disk
                    || options.contains(LoadOptions::IGNORE_DISK_CACHE)
                {
                    CacheType::MEMORY
                } else {
                    CacheType::ALL
                };
                self.cache
                    .store(ctx.key(), Some(artifact.clone()), Some(data.clone()), store)
                    .await;
                debug!(key = %ctx.key(), tier = %tier, "load served");
                Some(Ok(LoadedArtifact::new(Some(artifact), Some(data), tier)))
            }
            Err(e) => {
                if matches!(e, LoadError::InvalidData) && tier == Tier::Network {
                    self.add_to_blacklist(ctx.url());
                }
                warn!(key = %ctx.key(), tier = %tier, error = %e, "load failed");
                Some(Err(e))
            }
        }
    }

    /// Decodes raw bytes into an artifact and applies `editor`. Multi-frame
    /// data becomes an animated artifact that edits its frames lazily.
    fn decode_artifact(
        &self,
        data: &Bytes,
        editor: Option<&Arc<dyn Editor>>,
        decompress: bool,
    ) -> Result<Artifact, LoadError> {
        if let Some(animated) = self.codecs.animated()
            && animated.can_decode_animation(data)
            && let Some(source) = animated.open(data.clone())
            && let Some(artifact) = AnimatedArtifact::new(source, Arc::clone(&self.probe))
        {
            artifact.set_editor(editor.cloned());
            return Ok(Artifact::Animated(Arc::new(artifact)));
        }

        let decoder = self.codecs.decoder();
        let image = decoder.decode(data).ok_or(LoadError::InvalidData)?;
        match editor {
            Some(editor) => apply_edit(editor.as_ref(), &image)
                .map(Artifact::from)
                .ok_or_else(|| LoadError::edit_failed(editor.key())),
            None if decompress => Ok(Artifact::from(
                decoder.decompress(&image, data).unwrap_or(image),
            )),
            None => Ok(Artifact::from(image)),
        }
    }

    fn add_to_blacklist(&self, url: &Url) {
        if self.blacklist.lock().insert(url.clone()) {
            warn!(url = %url, "url blacklisted");
        }
    }

    fn attach_download(&self, id: LoadTaskId, handle: TaskHandle) -> bool {
        let mut registry = self.registry.lock();
        match registry.tasks.get_mut(&id) {
            Some(entry) if !entry.token.is_cancelled() => {
                entry.download = Some(handle);
                true
            }
            _ => false,
        }
    }

    fn forget(&self, id: LoadTaskId) {
        let mut registry = self.registry.lock();
        registry.tasks.remove(&id);
        registry.preload.remove(&id);
    }

    fn cancel_task(&self, id: LoadTaskId) {
        let entry = {
            let mut registry = self.registry.lock();
            registry.preload.remove(&id);
            registry.tasks.remove(&id)
        };
        if let Some(entry) = entry {
            entry.token.cancel();
            if let Some(download) = entry.download {
                self.downloader.cancel(&download);
            }
            debug!(task = id, "load cancelled");
        }
    }
}
