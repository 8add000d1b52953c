//! Network fetch layer.
//!
//! This module provides:
//! - Admission control with normal and preload lanes
//! - Per-URL operations shared by all subscribers
//! - The downloader merging requests and delivering progress
//! - The reqwest transport

pub mod downloader;
pub mod http_transport;
pub mod operation;
pub mod operation_queue;

pub use downloader::{Downloader, DownloaderConfig};
pub use http_transport::HttpTransport;
pub use operation::{DownloadEvent, DownloadResult, DownloadTask, TaskHandle, TaskId};
pub use operation_queue::{Lane, OperationId, OperationQueue};
