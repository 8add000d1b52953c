//! Application configuration.

pub mod app_config;
pub mod args;
pub mod loader;

pub use app_config::{AppConfig, DiskSection, DownloadSection, LogLevel, MemorySection};
pub use args::{ClearTarget, CliArgs, Command};
pub use loader::{ConfigError, ConfigLoader};
