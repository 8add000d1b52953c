//! URL-keyed download merging with bounded concurrency.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};
use url::Url;

use super::operation::{DownloadResult, DownloadTask, Operation, TaskHandle};
use super::operation_queue::{Lane, OperationId, OperationQueue};
use crate::domain::entities::{DecodedImage, LoadOptions};
use crate::domain::errors::{LoadError, TransportError};
use crate::domain::ports::{DownloadRequest, IncrementalDecode, ProgressiveDecoder, Transport};

const MAX_PREALLOCATION: u64 = 8 * 1024 * 1024;

/// Downloader settings.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Maximum operations running at once.
    pub max_concurrent: usize,
    /// Deadline for one operation, from request to last byte.
    pub timeout: Duration,
    /// Headers sent with every request.
    pub headers: BTreeMap<String, String>,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 6,
            timeout: Duration::from_secs(15),
            headers: BTreeMap::from([("Accept".to_string(), "image/*;q=0.8".to_string())]),
        }
    }
}

struct State {
    queue: OperationQueue,
    operations: HashMap<String, Arc<Operation>>,
    next_operation: OperationId,
}

impl State {
    fn operation(&self, id: OperationId) -> Option<Arc<Operation>> {
        self.operations.values().find(|op| op.id == id).cloned()
    }

    fn forget(&mut self, op: &Operation) {
        let key = op.url.as_str();
        if self.operations.get(key).is_some_and(|current| current.id == op.id) {
            self.operations.remove(key);
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    progressive: Option<Arc<dyn ProgressiveDecoder>>,
    timeout: Duration,
    headers: RwLock<BTreeMap<String, String>>,
    state: Mutex<State>,
    next_task: AtomicU64,
}

/// Merges concurrent requests for the same URL into one operation and bounds
/// how many operations use the network at once.
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<Inner>,
}

impl Downloader {
    /// Creates a downloader over `transport`. With a progressive decoder,
    /// tasks asking for progressive delivery receive partial images.
    #[must_use]
    pub fn new(
        config: DownloaderConfig,
        transport: Arc<dyn Transport>,
        progressive: Option<Arc<dyn ProgressiveDecoder>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                progressive,
                timeout: config.timeout,
                headers: RwLock::new(config.headers),
                state: Mutex::new(State {
                    queue: OperationQueue::new(config.max_concurrent),
                    operations: HashMap::new(),
                    next_operation: 1,
                }),
                next_task: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribes to `url`, starting or queueing an operation if none is in
    /// flight. A normal request promotes a queued preload operation.
    ///
    /// Must be called within a Tokio runtime.
    pub fn download(&self, url: &Url, options: LoadOptions) -> DownloadTask {
        let task_id = self.inner.next_task.fetch_add(1, Ordering::Relaxed);
        let preload = options.contains(LoadOptions::PRELOAD);
        let mut state = self.inner.state.lock();

        if let Some(op) = state.operations.get(url.as_str()).cloned()
            && let Some(task) = op.subscribe(task_id, options)
        {
            if !preload && state.queue.upgrade_preload(op.id) {
                debug!(url = %url, "preload operation promoted");
            }
            trace!(url = %url, task = task_id, "joined in-flight download");
            return task;
        }

        let op_id = state.next_operation;
        state.next_operation += 1;
        let (op, task) = Operation::with_task(op_id, url.clone(), task_id, options);
        let op = Arc::new(op);
        state.operations.insert(url.to_string(), Arc::clone(&op));

        let lane = if preload { Lane::Preload } else { Lane::Normal };
        if state.queue.add(op_id, lane) {
            op.mark_started();
            drop(state);
            self.spawn(op);
        } else {
            debug!(url = %url, ?lane, "download queued");
        }
        task
    }

    fn spawn(&self, op: Arc<Operation>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run(op).await });
    }

    fn start_all(&self, ops: Vec<Arc<Operation>>) {
        for op in ops {
            self.spawn(op);
        }
    }

    /// Cancels one task. The operation stops only when it has no live task left.
    pub fn cancel(&self, handle: &TaskHandle) {
        let op = self.inner.state.lock().operations.get(&handle.url).cloned();
        if let Some(op) = op
            && op.cancel_tasks(|id, _| id == handle.id)
        {
            self.cancel_operation(&op);
        }
    }

    /// Cancels every task subscribed to `url`.
    pub fn cancel_url(&self, url: &Url) {
        let op = self.inner.state.lock().operations.get(url.as_str()).cloned();
        if let Some(op) = op
            && op.cancel_tasks(|_, _| true)
        {
            self.cancel_operation(&op);
        }
    }

    /// Cancels every preload task.
    pub fn cancel_preloading(&self) {
        self.cancel_where(|options| options.contains(LoadOptions::PRELOAD));
    }

    /// Cancels every task.
    pub fn cancel_all(&self) {
        self.cancel_where(|_| true);
    }

    fn cancel_where(&self, filter: impl Fn(LoadOptions) -> bool) {
        let ops: Vec<_> = self.inner.state.lock().operations.values().cloned().collect();
        for op in ops {
            if op.cancel_tasks(|_, options| filter(options)) {
                self.cancel_operation(&op);
            }
        }
    }

    /// Retires an operation whose last task was cancelled. `cancel_tasks`
    /// already cancelled its token.
    fn cancel_operation(&self, op: &Arc<Operation>) {
        let mut state = self.inner.state.lock();
        if op.is_started() {
            // The running task notices the token and retires itself.
            return;
        }
        let next = state
            .queue
            .remove(op.id)
            .and_then(|id| state.operation(id))
            .inspect(|next| next.mark_started());
        state.forget(op);
        drop(state);
        debug!(url = %op.url, "queued download cancelled");
        if let Some(next) = next {
            self.spawn(next);
        }
    }

    /// Sets or, with None, removes a header sent with every request.
    pub fn set_header(&self, field: &str, value: Option<&str>) {
        let mut headers = self.inner.headers.write();
        match value {
            Some(value) => {
                headers.insert(field.to_string(), value.to_string());
            }
            None => {
                headers.remove(field);
            }
        }
    }

    /// Current value of a request header.
    #[must_use]
    pub fn header(&self, field: &str) -> Option<String> {
        self.inner.headers.read().get(field).cloned()
    }

    /// Operations in flight, running or queued.
    #[must_use]
    pub fn current_download_count(&self) -> usize {
        self.inner.state.lock().operations.len()
    }

    /// Live preload tasks across all operations.
    #[must_use]
    pub fn current_preload_task_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .operations
            .values()
            .map(|op| op.live_preload_count())
            .sum()
    }

    /// Concurrency bound.
    #[must_use]
    pub fn max_concurrent_downloads(&self) -> usize {
        self.inner.state.lock().queue.max_running()
    }

    /// Changes the concurrency bound, starting queued operations if it grew.
    pub fn set_max_concurrent_downloads(&self, max: usize) {
        let ops = {
            let mut state = self.inner.state.lock();
            let admitted = state.queue.set_max_running(max);
            admitted
                .into_iter()
                .filter_map(|id| state.operation(id))
                .inspect(|op| op.mark_started())
                .collect()
        };
        self.start_all(ops);
    }
}

impl Inner {
    fn run(self: Arc<Self>, op: Arc<Operation>) -> impl std::future::Future<Output = ()> + Send {
        async move {
            debug!(url = %op.url, "download started");
            let result = tokio::select! {
                biased;
                () = op.token.cancelled() => Err(LoadError::from(TransportError::cancelled())),
                result = tokio::time::timeout(self.timeout, self.fetch(&op)) => {
                    result.unwrap_or_else(|_| {
                        Err(LoadError::from(TransportError::timeout(format!(
                            "no complete response within {:?}",
                            self.timeout
                        ))))
                    })
                }
            };

            match &result {
                Ok(data) => debug!(url = %op.url, bytes = data.len(), "download finished"),
                Err(e) if op.token.is_cancelled() => debug!(url = %op.url, error = %e, "download cancelled"),
                Err(e) => warn!(url = %op.url, error = %e, "download failed"),
            }
            let delivered = op.finish(&result);
            trace!(url = %op.url, delivered, "download delivered");

            let next = {
                let mut state = self.state.lock();
                state.forget(&op);
                state
                    .queue
                    .remove(op.id)
                    .and_then(|id| state.operation(id))
                    .inspect(|next| next.mark_started())
            };
            if let Some(next) = next {
                let inner = Arc::clone(&self);
                tokio::spawn(async move { inner.run(next).await });
            }
        }
    }

    async fn fetch(&self, op: &Operation) -> DownloadResult {
        let request = DownloadRequest {
            url: op.url.clone(),
            headers: self
                .headers
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            timeout: self.timeout,
        };
        let mut body = self.transport.send(&request).await?;

        let status = body.status();
        if status >= 400 || status == 304 {
            return Err(TransportError::status(status).into());
        }

        let expected = body.content_length();
        let capacity = expected.map_or(0, |n| n.min(MAX_PREALLOCATION));
        let mut buffer = BytesMut::with_capacity(usize::try_from(capacity).unwrap_or(0));
        let mut decoder: Option<Box<dyn IncrementalDecode>> = None;
        op.progress(0, expected, None);

        while let Some(chunk) = body.chunk().await? {
            buffer.extend_from_slice(&chunk);
            let partial = if op.wants_progressive() {
                self.partial_decode(&mut decoder, &buffer, chunk).await
            } else {
                decoder = None;
                None
            };
            op.progress(buffer.len() as u64, expected, partial.as_ref());
        }

        if buffer.is_empty() {
            return Err(LoadError::no_data(op.url.as_str()));
        }
        Ok(buffer.freeze())
    }

    /// Feeds `chunk` to the download's incremental session. A new session is
    /// seeded once with everything `received` so far; after that it only
    /// sees the new chunks.
    async fn partial_decode(
        &self,
        state: &mut Option<Box<dyn IncrementalDecode>>,
        received: &[u8],
        chunk: Bytes,
    ) -> Option<Arc<DecodedImage>> {
        let progressive = self.progressive.as_ref()?;
        let (decoder, input) = match state.take() {
            Some(decoder) => (decoder, chunk),
            None if progressive.can_incrementally_decode(received) => {
                (progressive.begin(), Bytes::copy_from_slice(received))
            }
            None => return None,
        };
        let (decoder, image) = tokio::task::spawn_blocking(move || {
            let mut decoder = decoder;
            let image = decoder.push(&input, false);
            (decoder, image)
        })
        .await
        .ok()?;
        *state = Some(decoder);
        image.map(Arc::new)
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Downloader")
            .field("operations", &state.operations.len())
            .field("running", &state.queue.running_count())
            .field("waiting", &state.queue.waiting_count())
            .field("timeout", &self.inner.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::TransportErrorKind;
    use crate::domain::ports::mocks::{Reply, ScriptedTransport};
    use crate::infrastructure::codec::ImageCodec;
    use crate::infrastructure::codec::fixtures::png;
    use crate::infrastructure::download::DownloadEvent;
    use futures_util::future::join_all;

    const A: &str = "https://cdn.test/a.png";
    const B: &str = "https://cdn.test/b.png";
    const C: &str = "https://cdn.test/c.png";

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn downloader(transport: &Arc<ScriptedTransport>, max: usize) -> Downloader {
        Downloader::new(
            DownloaderConfig {
                max_concurrent: max,
                ..DownloaderConfig::default()
            },
            Arc::clone(transport) as Arc<dyn Transport>,
            None,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_operation() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(A, Reply::ok("payload").delayed(Duration::from_millis(50)));
        let downloader = downloader(&transport, 6);

        let tasks: Vec<_> = (0..5)
            .map(|_| downloader.download(&url(A), LoadOptions::empty()))
            .collect();
        assert_eq!(downloader.current_download_count(), 1);

        let results = join_all(tasks.into_iter().map(DownloadTask::finished)).await;
        assert_eq!(transport.calls(A), 1);
        assert_eq!(results.len(), 5);
        for result in results {
            assert_eq!(result.unwrap().unwrap(), Bytes::from_static(b"payload"));
        }
        assert_eq!(downloader.current_download_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound_is_respected() {
        let transport = Arc::new(ScriptedTransport::new());
        for u in [A, B, C] {
            transport.reply(u, Reply::ok("x").delayed(Duration::from_millis(20)));
        }
        let downloader = downloader(&transport, 1);

        let tasks: Vec<_> = [A, B, C]
            .iter()
            .map(|u| downloader.download(&url(u), LoadOptions::empty()))
            .collect();
        join_all(tasks.into_iter().map(DownloadTask::finished)).await;

        assert_eq!(transport.total_calls(), 3);
        assert_eq!(transport.peak_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_request_promotes_queued_preload() {
        let transport = Arc::new(ScriptedTransport::new());
        for u in [A, B, C] {
            transport.reply(u, Reply::ok(u.to_string()).delayed(Duration::from_millis(10)));
        }
        let downloader = downloader(&transport, 1);

        let first = downloader.download(&url(A), LoadOptions::empty());
        let preload = downloader.download(&url(B), LoadOptions::PRELOAD);
        let normal = downloader.download(&url(C), LoadOptions::empty());
        let promoted = downloader.download(&url(B), LoadOptions::empty());
        assert_eq!(downloader.current_preload_task_count(), 1);

        assert_eq!(transport.calls(B), 0);
        first.finished().await;
        normal.finished().await;
        assert!(promoted.finished().await.unwrap().is_ok());
        assert!(preload.finished().await.unwrap().is_ok());
        assert_eq!(transport.calls(B), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_cancel_keeps_operation() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(A, Reply::ok("data").delayed(Duration::from_millis(30)));
        let downloader = downloader(&transport, 6);

        let cancelled = downloader.download(&url(A), LoadOptions::empty());
        let kept = downloader.download(&url(A), LoadOptions::empty());
        downloader.cancel(&cancelled.handle());

        assert!(cancelled.finished().await.is_none());
        assert!(kept.finished().await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cancel_frees_slot() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(A, Reply::ok("a").delayed(Duration::from_secs(5)));
        transport.reply(B, Reply::ok("b"));
        let downloader = downloader(&transport, 1);

        let slow = downloader.download(&url(A), LoadOptions::empty());
        let waiting = downloader.download(&url(B), LoadOptions::empty());
        downloader.cancel_url(&url(A));

        assert!(slow.finished().await.is_none());
        assert!(waiting.finished().await.unwrap().is_ok());
        assert_eq!(downloader.current_download_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_preloading_spares_normal_tasks() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(A, Reply::ok("a").delayed(Duration::from_millis(10)));
        transport.reply(B, Reply::ok("b").delayed(Duration::from_millis(10)));
        let downloader = downloader(&transport, 1);

        let normal = downloader.download(&url(A), LoadOptions::empty());
        let queued_preload = downloader.download(&url(B), LoadOptions::PRELOAD);
        downloader.cancel_preloading();

        assert_eq!(downloader.current_preload_task_count(), 0);
        assert_eq!(downloader.current_download_count(), 1);
        assert!(normal.finished().await.unwrap().is_ok());
        assert!(queued_preload.finished().await.is_none());
        assert_eq!(transport.calls(B), 0);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(A, Reply::status(304));
        transport.reply(B, Reply::status(200));
        let downloader = downloader(&transport, 6);

        let not_modified = downloader.download(&url(A), LoadOptions::empty());
        match not_modified.finished().await {
            Some(Err(LoadError::NetworkPermanent { source })) => {
                assert_eq!(source.kind, TransportErrorKind::Status(304));
            }
            other => panic!("unexpected {other:?}"),
        }

        let empty = downloader.download(&url(B), LoadOptions::empty());
        assert!(matches!(
            empty.finished().await,
            Some(Err(LoadError::NoData { .. }))
        ));

        let missing = downloader.download(&url(C), LoadOptions::empty());
        assert!(matches!(
            missing.finished().await,
            Some(Err(e)) if e.blacklists_url()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(A, Reply::ok("late").delayed(Duration::from_secs(60)));
        let downloader = downloader(&transport, 6);

        let task = downloader.download(&url(A), LoadOptions::empty());
        let result = task.finished().await.unwrap();
        assert!(matches!(result, Err(ref e) if e.is_retryable()));
    }

    #[tokio::test]
    async fn test_progress_reported_per_chunk() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(A, Reply::ok("abcdefgh").chunked(3));
        let downloader = downloader(&transport, 6);

        let mut task = downloader.download(&url(A), LoadOptions::empty());
        let mut progress = Vec::new();
        let mut outcome = None;
        while let Some(event) = task.next_event().await {
            match event {
                DownloadEvent::Progress { received, expected, .. } => {
                    assert_eq!(expected, Some(8));
                    progress.push(received);
                }
                DownloadEvent::Finished(result) => outcome = Some(result),
            }
        }
        assert_eq!(progress, vec![0, 3, 6, 8]);
        assert_eq!(outcome.unwrap().unwrap().len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_raising_bound_starts_waiters() {
        let transport = Arc::new(ScriptedTransport::new());
        for u in [A, B] {
            transport.reply(u, Reply::ok("x").delayed(Duration::from_millis(10)));
        }
        let downloader = downloader(&transport, 1);
        let a = downloader.download(&url(A), LoadOptions::empty());
        let b = downloader.download(&url(B), LoadOptions::empty());
        downloader.set_max_concurrent_downloads(2);
        assert_eq!(downloader.max_concurrent_downloads(), 2);

        join_all([a.finished(), b.finished()]).await;
        assert_eq!(transport.peak_in_flight(), 2);
    }

    #[test]
    fn test_headers_can_be_replaced_and_removed() {
        let transport = Arc::new(ScriptedTransport::new());
        let downloader = downloader(&transport, 6);
        assert_eq!(downloader.header("Accept").as_deref(), Some("image/*;q=0.8"));

        downloader.set_header("X-Client", Some("tiercache"));
        downloader.set_header("Accept", None);
        assert_eq!(downloader.header("X-Client").as_deref(), Some("tiercache"));
        assert_eq!(downloader.header("Accept"), None);
    }

    fn in_flight(downloader: &Downloader, u: &str) -> Arc<Operation> {
        downloader.inner.state.lock().operations.get(u).cloned().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_racing_last_cancel_gets_fresh_running_operation() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(A, Reply::ok("fresh").delayed(Duration::from_millis(20)));
        let downloader = downloader(&transport, 6);

        let doomed = downloader.download(&url(A), LoadOptions::empty());
        let op = in_flight(&downloader, A);
        assert!(op.cancel_tasks(|id, _| id == doomed.handle().id()));
        let fresh = downloader.download(&url(A), LoadOptions::empty());
        downloader.cancel_operation(&op);

        assert!(doomed.finished().await.is_none());
        let result = fresh.finished().await.unwrap();
        assert_eq!(result.unwrap(), Bytes::from_static(b"fresh"));
        assert_eq!(downloader.current_download_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_racing_last_cancel_gets_fresh_queued_operation() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(A, Reply::ok("a"));
        transport.reply(B, Reply::ok("b").delayed(Duration::from_millis(20)));
        let downloader = downloader(&transport, 1);

        let running = downloader.download(&url(B), LoadOptions::empty());
        let doomed = downloader.download(&url(A), LoadOptions::empty());
        let op = in_flight(&downloader, A);
        assert!(op.cancel_tasks(|id, _| id == doomed.handle().id()));
        let fresh = downloader.download(&url(A), LoadOptions::empty());
        downloader.cancel_operation(&op);
        assert_eq!(downloader.current_download_count(), 2);

        assert!(running.finished().await.unwrap().is_ok());
        let result = fresh.finished().await.unwrap();
        assert_eq!(result.unwrap(), Bytes::from_static(b"a"));
        assert_eq!(transport.calls(A), 1);
    }

    #[tokio::test]
    async fn test_partial_images_reach_only_progressive_tasks() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(A, Reply::ok(png(8)).chunked(16));
        let downloader = Downloader::new(
            DownloaderConfig::default(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Some(Arc::new(ImageCodec::new())),
        );

        let mut progressive = downloader.download(&url(A), LoadOptions::PROGRESSIVE_DOWNLOAD);
        let mut plain = downloader.download(&url(A), LoadOptions::empty());

        let mut partials = 0;
        let mut finished = false;
        while let Some(event) = progressive.next_event().await {
            match event {
                DownloadEvent::Progress { partial, .. } => {
                    assert!(!finished);
                    if let Some(image) = partial {
                        assert_eq!(image.width(), 8);
                        partials += 1;
                    }
                }
                DownloadEvent::Finished(result) => {
                    assert!(result.is_ok());
                    finished = true;
                }
            }
        }
        assert!(finished);
        assert!(partials > 0);

        let mut plain_finished = false;
        while let Some(event) = plain.next_event().await {
            match event {
                DownloadEvent::Progress { partial, .. } => assert!(partial.is_none()),
                DownloadEvent::Finished(result) => plain_finished = result.is_ok(),
            }
        }
        assert!(plain_finished);
        assert_eq!(transport.calls(A), 1);
    }
}
