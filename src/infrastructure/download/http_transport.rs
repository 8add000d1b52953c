//! reqwest-backed transport, with local file support.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

use crate::domain::errors::TransportError;
use crate::domain::ports::{DownloadRequest, ResponseBody, Transport};

const USER_AGENT: &str = concat!("tiercache/", env!("CARGO_PKG_VERSION"));

/// Fetches `http(s)` URLs with reqwest and `file` URLs from the local disk.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport with its own connection pool.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| TransportError::other(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn header_map(request: &DownloadRequest) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "skipping invalid request header"),
            }
        }
        headers
    }

    async fn read_file(request: &DownloadRequest) -> Result<Box<dyn ResponseBody>, TransportError> {
        let path = request
            .url
            .to_file_path()
            .map_err(|()| TransportError::other(format!("not a local path: {}", request.url)))?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| TransportError::other(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), bytes = data.len(), "read local file");
        Ok(Box::new(FileBody {
            remaining: Some(Bytes::from(data)),
        }))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &DownloadRequest) -> Result<Box<dyn ResponseBody>, TransportError> {
        match request.url.scheme() {
            "file" => Self::read_file(request).await,
            "http" | "https" => {
                let response = self
                    .client
                    .get(request.url.clone())
                    .headers(Self::header_map(request))
                    .timeout(request.timeout)
                    .send()
                    .await?;
                Ok(Box::new(HttpBody { response }))
            }
            scheme => Err(TransportError::other(format!("unsupported scheme: {scheme}"))),
        }
    }
}

struct HttpBody {
    response: reqwest::Response,
}

#[async_trait]
impl ResponseBody for HttpBody {
    fn status(&self) -> u16 {
        self.response.status().as_u16()
    }

    fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    async fn chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.response.chunk().await?)
    }
}

struct FileBody {
    remaining: Option<Bytes>,
}

#[async_trait]
impl ResponseBody for FileBody {
    fn status(&self) -> u16 {
        200
    }

    fn content_length(&self) -> Option<u64> {
        self.remaining.as_ref().map(|data| data.len() as u64)
    }

    async fn chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.remaining.take().filter(|data| !data.is_empty()))
    }
}
