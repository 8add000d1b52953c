//! Network transport port definition.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::domain::errors::TransportError;

/// One outgoing request issued by a download operation.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Source URL.
    pub url: Url,
    /// Header name/value pairs sent with the request.
    pub headers: Vec<(String, String)>,
    /// Deadline for the whole request.
    pub timeout: Duration,
}

/// Streaming response body.
#[async_trait]
pub trait ResponseBody: Send {
    /// HTTP status code. Local file reads report 200.
    fn status(&self) -> u16;

    /// Expected body size, when announced.
    fn content_length(&self) -> Option<u64>;

    /// Next chunk of the body; `Ok(None)` marks the end.
    async fn chunk(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// Port for fetching resources.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` and returns once response headers are available.
    async fn send(&self, request: &DownloadRequest)
    -> Result<Box<dyn ResponseBody>, TransportError>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Canned reply for one URL.
    #[derive(Clone)]
    pub struct Reply {
        pub status: u16,
        pub body: Bytes,
        pub chunk_size: usize,
        pub delay: Duration,
        pub error: Option<TransportError>,
    }

    impl Reply {
        /// 200 with the given body delivered in one chunk.
        pub fn ok(body: impl Into<Bytes>) -> Self {
            Self {
                status: 200,
                body: body.into(),
                chunk_size: usize::MAX,
                delay: Duration::ZERO,
                error: None,
            }
        }

        /// Status-only reply with an empty body.
        pub fn status(status: u16) -> Self {
            Self {
                status,
                ..Self::ok(Bytes::new())
            }
        }

        /// Fails before any response arrives.
        pub fn fail(error: TransportError) -> Self {
            Self {
                error: Some(error),
                ..Self::ok(Bytes::new())
            }
        }

        /// Waits `delay` before the response headers.
        pub fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        /// Splits the body into chunks of `size` bytes.
        pub fn chunked(mut self, size: usize) -> Self {
            self.chunk_size = size.max(1);
            self
        }
    }

    /// Transport answering from a table of canned replies.
    #[derive(Default)]
    pub struct ScriptedTransport {
        replies: Mutex<HashMap<String, Reply>>,
        calls: Mutex<HashMap<String, usize>>,
        total: AtomicUsize,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers the reply for `url`.
        pub fn reply(&self, url: &str, reply: Reply) {
            self.replies.lock().insert(url.to_string(), reply);
        }

        /// Number of requests sent for `url`.
        pub fn calls(&self, url: &str) -> usize {
            self.calls.lock().get(url).copied().unwrap_or(0)
        }

        /// Number of requests sent overall.
        pub fn total_calls(&self) -> usize {
            self.total.load(Ordering::SeqCst)
        }

        /// Highest number of requests waiting on their delay at once.
        pub fn peak_in_flight(&self) -> usize {
            self.peak_in_flight.load(Ordering::SeqCst)
        }
    }

    struct ScriptedBody {
        status: u16,
        remaining: Bytes,
        chunk_size: usize,
    }

    #[async_trait]
    impl ResponseBody for ScriptedBody {
        fn status(&self) -> u16 {
            self.status
        }

        fn content_length(&self) -> Option<u64> {
            Some(self.remaining.len() as u64)
        }

        async fn chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
            if self.remaining.is_empty() {
                return Ok(None);
            }
            let take = self.chunk_size.min(self.remaining.len());
            Ok(Some(self.remaining.split_to(take)))
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            request: &DownloadRequest,
        ) -> Result<Box<dyn ResponseBody>, TransportError> {
            let url = request.url.to_string();
            *self.calls.lock().entry(url.clone()).or_insert(0) += 1;
            self.total.fetch_add(1, Ordering::SeqCst);

            let reply = self
                .replies
                .lock()
                .get(&url)
                .cloned()
                .unwrap_or_else(|| Reply::status(404));

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            if !reply.delay.is_zero() {
                tokio::time::sleep(reply.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some(error) = reply.error {
                return Err(error);
            }
            Ok(Box::new(ScriptedBody {
                status: reply.status,
                remaining: reply.body,
                chunk_size: reply.chunk_size,
            }))
        }
    }
}
