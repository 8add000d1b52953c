//! One in-flight download shared by every task requesting the same URL.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::operation_queue::OperationId;
use crate::domain::entities::{DecodedImage, LoadOptions};
use crate::domain::errors::LoadError;

/// Identifier of one subscriber task.
pub type TaskId = u64;

/// Outcome of a download.
pub type DownloadResult = Result<Bytes, LoadError>;

/// What a subscriber task observes, in order: any number of progress events,
/// then exactly one `Finished`, unless the task is cancelled first.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// More of the body arrived.
    Progress {
        /// Bytes received so far.
        received: u64,
        /// Announced body size.
        expected: Option<u64>,
        /// Partial decode of what arrived so far, for progressive tasks.
        partial: Option<Arc<DecodedImage>>,
    },
    /// The operation ended.
    Finished(DownloadResult),
}

/// Cancellation handle for a [`DownloadTask`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub(super) id: TaskId,
    pub(super) url: String,
}

impl TaskHandle {
    /// Task id.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// URL the task subscribed to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// A subscriber's view of a download.
#[derive(Debug)]
pub struct DownloadTask {
    handle: TaskHandle,
    preload: bool,
    events: mpsc::UnboundedReceiver<DownloadEvent>,
}

impl DownloadTask {
    /// Handle for cancelling this task through the downloader.
    #[must_use]
    pub fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }

    /// Returns true if this task was issued as a preload.
    #[must_use]
    pub const fn is_preload(&self) -> bool {
        self.preload
    }

    /// Next event, or None once the task is finished or cancelled.
    pub async fn next_event(&mut self) -> Option<DownloadEvent> {
        self.events.recv().await
    }

    /// Skips progress and waits for the outcome. None if the task was cancelled.
    pub async fn finished(mut self) -> Option<DownloadResult> {
        while let Some(event) = self.events.recv().await {
            if let DownloadEvent::Finished(result) = event {
                return Some(result);
            }
        }
        None
    }
}

struct Subscriber {
    id: TaskId,
    options: LoadOptions,
    events: Option<mpsc::UnboundedSender<DownloadEvent>>,
}

impl Subscriber {
    const fn is_live(&self) -> bool {
        self.events.is_some()
    }
}

#[derive(Default)]
struct Subscribers {
    tasks: Vec<Subscriber>,
    finished: bool,
}

/// Shared state of one download. Lives in the downloader's table until it
/// finishes or every subscriber cancels.
pub(super) struct Operation {
    pub(super) id: OperationId,
    pub(super) url: Url,
    pub(super) token: CancellationToken,
    started: AtomicBool,
    subscribers: Mutex<Subscribers>,
}

impl Operation {
    pub(super) fn new(id: OperationId, url: Url) -> Self {
        Self {
            id,
            url,
            token: CancellationToken::new(),
            started: AtomicBool::new(false),
            subscribers: Mutex::new(Subscribers::default()),
        }
    }

    /// Attaches a task. Returns None if the operation can no longer take
    /// subscribers because it finished or was cancelled.
    pub(super) fn subscribe(&self, id: TaskId, options: LoadOptions) -> Option<DownloadTask> {
        let mut subscribers = self.subscribers.lock();
        if subscribers.finished || self.token.is_cancelled() {
            return None;
        }
        Some(self.attach(&mut subscribers, id, options))
    }

    /// Creates an operation with `task` as its first subscriber.
    pub(super) fn with_task(
        id: OperationId,
        url: Url,
        task: TaskId,
        options: LoadOptions,
    ) -> (Self, DownloadTask) {
        let op = Self::new(id, url);
        let first = {
            let mut subscribers = op.subscribers.lock();
            op.attach(&mut subscribers, task, options)
        };
        (op, first)
    }

    fn attach(&self, subscribers: &mut Subscribers, id: TaskId, options: LoadOptions) -> DownloadTask {
        let (tx, rx) = mpsc::unbounded_channel();
        subscribers.tasks.push(Subscriber {
            id,
            options,
            events: Some(tx),
        });
        DownloadTask {
            handle: TaskHandle {
                id,
                url: self.url.to_string(),
            },
            preload: options.contains(LoadOptions::PRELOAD),
            events: rx,
        }
    }

    /// Cancels the live tasks matching `filter`. Returns true if that left no
    /// live task. The token is then cancelled before the subscriber lock is
    /// released, so a concurrent `subscribe` starts a fresh operation instead
    /// of joining this one; the caller still has to retire it.
    pub(super) fn cancel_tasks(&self, filter: impl Fn(TaskId, LoadOptions) -> bool) -> bool {
        let mut subscribers = self.subscribers.lock();
        let mut cancelled_any = false;
        for task in &mut subscribers.tasks {
            if task.is_live() && filter(task.id, task.options) {
                task.events = None;
                cancelled_any = true;
            }
        }
        let emptied = cancelled_any
            && !subscribers.finished
            && !subscribers.tasks.iter().any(Subscriber::is_live);
        if emptied {
            self.token.cancel();
        }
        emptied
    }

    pub(super) fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub(super) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Returns true if some live task asked for progressive delivery.
    pub(super) fn wants_progressive(&self) -> bool {
        self.subscribers
            .lock()
            .tasks
            .iter()
            .any(|task| task.is_live() && task.options.contains(LoadOptions::PROGRESSIVE_DOWNLOAD))
    }

    pub(super) fn live_preload_count(&self) -> usize {
        self.subscribers
            .lock()
            .tasks
            .iter()
            .filter(|task| task.is_live() && task.options.contains(LoadOptions::PRELOAD))
            .count()
    }

    /// Sends a progress event to every live task. The partial image only
    /// goes to tasks that asked for progressive delivery.
    pub(super) fn progress(
        &self,
        received: u64,
        expected: Option<u64>,
        partial: Option<&Arc<DecodedImage>>,
    ) {
        let subscribers = self.subscribers.lock();
        for task in &subscribers.tasks {
            if let Some(events) = &task.events {
                let partial = partial
                    .filter(|_| task.options.contains(LoadOptions::PROGRESSIVE_DOWNLOAD))
                    .cloned();
                let _ = events.send(DownloadEvent::Progress {
                    received,
                    expected,
                    partial,
                });
            }
        }
    }

    /// Delivers the outcome to every live task, once. Returns the number of
    /// tasks it reached.
    pub(super) fn finish(&self, result: &DownloadResult) -> usize {
        let mut subscribers = self.subscribers.lock();
        if subscribers.finished {
            return 0;
        }
        subscribers.finished = true;
        let mut delivered = 0;
        for task in &mut subscribers.tasks {
            if let Some(events) = task.events.take()
                && events.send(DownloadEvent::Finished(result.clone())).is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operation() -> Operation {
        Operation::new(1, Url::parse("https://cdn.test/a.png").unwrap())
    }

    #[tokio::test]
    async fn test_finish_reaches_live_tasks_once() {
        let op = operation();
        let first = op.subscribe(1, LoadOptions::empty()).unwrap();
        let second = op.subscribe(2, LoadOptions::empty()).unwrap();
        let third = op.subscribe(3, LoadOptions::empty()).unwrap();

        assert!(!op.cancel_tasks(|id, _| id == 2));
        let result: DownloadResult = Ok(Bytes::from_static(b"abc"));
        assert_eq!(op.finish(&result), 2);
        assert_eq!(op.finish(&result), 0);

        assert!(matches!(first.finished().await, Some(Ok(ref b)) if b.as_ref() == b"abc"));
        assert!(second.finished().await.is_none());
        assert!(third.finished().await.is_some());
        assert!(op.subscribe(4, LoadOptions::empty()).is_none());
    }

    #[tokio::test]
    async fn test_progress_precedes_completion() {
        let op = operation();
        let mut task = op.subscribe(1, LoadOptions::PROGRESSIVE_DOWNLOAD).unwrap();
        op.progress(4, Some(8), None);
        op.progress(8, Some(8), None);
        op.finish(&Ok(Bytes::from_static(b"12345678")));

        let mut received = Vec::new();
        while let Some(event) = task.next_event().await {
            match event {
                DownloadEvent::Progress { received: n, .. } => received.push(n),
                DownloadEvent::Finished(result) => {
                    assert!(result.is_ok());
                    received.push(u64::MAX);
                }
            }
        }
        assert_eq!(received, vec![4, 8, u64::MAX]);
    }

    #[test]
    fn test_last_cancel_reports_empty_operation() {
        let op = operation();
        let _a = op.subscribe(1, LoadOptions::PRELOAD).unwrap();
        let _b = op.subscribe(2, LoadOptions::empty()).unwrap();
        assert_eq!(op.live_preload_count(), 1);

        assert!(!op.cancel_tasks(|_, options| options.contains(LoadOptions::PRELOAD)));
        assert_eq!(op.live_preload_count(), 0);
        assert!(op.cancel_tasks(|_, _| true));
        assert!(!op.cancel_tasks(|_, _| true));
    }

    #[test]
    fn test_next_event_waits_for_delivery() {
        let op = operation();
        let mut task = op.subscribe(1, LoadOptions::empty()).unwrap();
        let mut next = tokio_test::task::spawn(task.next_event());
        tokio_test::assert_pending!(next.poll());

        op.progress(3, None, None);
        assert!(next.is_woken());
        let event = tokio_test::assert_ready!(next.poll());
        assert!(matches!(event, Some(DownloadEvent::Progress { received: 3, .. })));
    }

    #[test]
    fn test_emptied_operation_refuses_new_subscribers() {
        let op = operation();
        let only = op.subscribe(1, LoadOptions::empty()).unwrap();

        assert!(op.cancel_tasks(|id, _| id == only.handle().id()));
        assert!(op.token.is_cancelled());
        assert!(op.subscribe(2, LoadOptions::empty()).is_none());
    }
}
