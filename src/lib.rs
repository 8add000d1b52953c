//! Tiercache - a tiered memory, disk and network cache for fetched artifacts.
//!
//! This crate loads images and other binary artifacts through an in-process
//! LRU tier, a SQLite-indexed disk tier and a single-flight downloader, with
//! decoding, editing and animated frame caching on top.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Application layer containing the load manager and DTOs.
pub mod application;
/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing cache tiers and adapters for external services.
pub mod infrastructure;

/// Current version of the application.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name.
pub const NAME: &str = "tiercache";
