//! Application configuration.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::infrastructure::cache::{DiskStoreConfig, MemoryCacheConfig};
use crate::infrastructure::download::DownloaderConfig;

const APP_NAME: &str = "tiercache";
const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "linuxmobile";
pub(super) const CONFIG_FILE_NAME: &str = "config.toml";

/// Log level configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl LogLevel {
    /// Converts to tracing level.
    #[must_use]
    pub const fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Application configuration, read from `config.toml` and overridden by
/// command-line flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Configuration file path.
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[serde(skip)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Root directory of the disk tier. Defaults to the platform cache dir.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Memory tier limits.
    #[serde(default)]
    pub memory: MemorySection,

    /// Disk tier limits.
    #[serde(default)]
    pub disk: DiskSection,

    /// Network settings.
    #[serde(default)]
    pub download: DownloadSection,
}

/// `[memory]` section. Absent limits are unbounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySection {
    /// Total cost limit in bytes.
    #[serde(default)]
    pub cost_limit: Option<u64>,

    /// Entry count limit.
    #[serde(default)]
    pub count_limit: Option<u64>,

    /// Maximum entry age in seconds.
    #[serde(default)]
    pub age_limit_secs: Option<u64>,

    /// Interval of the background trim pass.
    #[serde(default = "default_memory_trim_interval")]
    pub trim_interval_secs: u64,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            cost_limit: None,
            count_limit: None,
            age_limit_secs: None,
            trim_interval_secs: default_memory_trim_interval(),
        }
    }
}

/// `[disk]` section. Absent limits are unbounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSection {
    /// Total payload size limit in bytes.
    #[serde(default)]
    pub cost_limit: Option<u64>,

    /// Entry count limit.
    #[serde(default)]
    pub count_limit: Option<u64>,

    /// Maximum time since last access, in seconds.
    #[serde(default)]
    pub age_limit_secs: Option<u64>,

    /// Payloads larger than this are stored as files.
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold: u64,

    /// Interval of the background trim pass.
    #[serde(default = "default_disk_trim_interval")]
    pub auto_trim_interval_secs: u64,
}

impl Default for DiskSection {
    fn default() -> Self {
        Self {
            cost_limit: None,
            count_limit: None,
            age_limit_secs: None,
            inline_threshold: default_inline_threshold(),
            auto_trim_interval_secs: default_disk_trim_interval(),
        }
    }
}

/// `[download]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSection {
    /// Maximum number of downloads running at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Headers sent with every request.
    #[serde(default = "default_headers")]
    pub headers: BTreeMap<String, String>,
}

impl Default for DownloadSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            timeout_secs: default_timeout(),
            headers: default_headers(),
        }
    }
}

fn default_memory_trim_interval() -> u64 {
    5
}

fn default_inline_threshold() -> u64 {
    20 * 1024
}

fn default_disk_trim_interval() -> u64 {
    60
}

fn default_max_concurrent() -> usize {
    6
}

fn default_timeout() -> u64 {
    15
}

fn default_headers() -> BTreeMap<String, String> {
    BTreeMap::from([("Accept".to_string(), "image/*;q=0.8".to_string())])
}

use super::args::CliArgs;

impl AppConfig {
    /// Merges CLI arguments into the configuration.
    pub fn merge_with_args(&mut self, args: &CliArgs) {
        if let Some(config_path) = &args.config {
            self.config = Some(config_path.clone());
        }
        if let Some(log_path) = &args.log_path {
            self.log_path = Some(log_path.clone());
        }
        if let Some(log_level) = args.log_level {
            self.log_level = log_level;
        }
        if let Some(cache_dir) = &args.cache_dir {
            self.cache_dir = Some(cache_dir.clone());
        }
        if let Some(max_concurrent) = args.max_concurrent {
            self.download.max_concurrent = max_concurrent;
        }
        if let Some(timeout_secs) = args.timeout_secs {
            self.download.timeout_secs = timeout_secs;
        }
    }

    /// Returns default config directory.
    #[must_use]
    pub fn default_config_dir() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Returns default config file path.
    #[must_use]
    pub fn default_config_path() -> Option<PathBuf> {
        Self::default_config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
    }

    /// Returns default cache directory.
    #[must_use]
    pub fn default_cache_dir() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.cache_dir().to_path_buf())
    }

    /// Returns effective config path.
    #[must_use]
    pub fn effective_config_path(&self) -> Option<PathBuf> {
        self.config.clone().or_else(Self::default_config_path)
    }

    /// Returns effective log path. Logs go to stderr when unset.
    #[must_use]
    pub fn effective_log_path(&self) -> Option<PathBuf> {
        self.log_path.clone()
    }

    /// Returns effective cache directory.
    #[must_use]
    pub fn effective_cache_dir(&self) -> Option<PathBuf> {
        self.cache_dir.clone().or_else(Self::default_cache_dir)
    }

    /// Memory tier settings.
    #[must_use]
    pub fn memory_cache_config(&self) -> MemoryCacheConfig {
        MemoryCacheConfig {
            cost_limit: self.memory.cost_limit.unwrap_or(u64::MAX),
            count_limit: self.memory.count_limit.unwrap_or(u64::MAX),
            age_limit: self
                .memory
                .age_limit_secs
                .map_or(Duration::MAX, Duration::from_secs),
            trim_interval: Duration::from_secs(self.memory.trim_interval_secs.max(1)),
        }
    }

    /// Disk tier settings.
    #[must_use]
    pub fn disk_store_config(&self) -> DiskStoreConfig {
        DiskStoreConfig {
            inline_threshold: self.disk.inline_threshold,
            cost_limit: self.disk.cost_limit.unwrap_or(u64::MAX),
            count_limit: self.disk.count_limit.unwrap_or(u64::MAX),
            age_limit: self
                .disk
                .age_limit_secs
                .map_or(Duration::MAX, Duration::from_secs),
            auto_trim_interval: Duration::from_secs(self.disk.auto_trim_interval_secs.max(1)),
        }
    }

    /// Network settings.
    #[must_use]
    pub fn downloader_config(&self) -> DownloaderConfig {
        DownloaderConfig {
            max_concurrent: self.download.max_concurrent.max(1),
            timeout: Duration::from_secs(self.download.timeout_secs),
            headers: self.download.headers.clone(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config: None,
            log_path: None,
            log_level: LogLevel::Info,
            cache_dir: None,
            memory: MemorySection::default(),
            disk: DiskSection::default(),
            download: DownloadSection::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_sections() {
        let toml_content = r#"
            log_level = "debug"
            cache_dir = "/var/cache/tiercache"

            [memory]
            count_limit = 200
            age_limit_secs = 600

            [disk]
            cost_limit = 104857600
            inline_threshold = 4096

            [download]
            max_concurrent = 2

            [download.headers]
            Accept = "*/*"
        "#;

        let config: AppConfig = toml::from_str(toml_content).expect("Failed to parse config");

        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.memory.count_limit, Some(200));
        assert_eq!(config.memory.trim_interval_secs, 5);
        assert_eq!(config.disk.inline_threshold, 4096);
        assert_eq!(config.disk.auto_trim_interval_secs, 60);
        assert_eq!(config.download.timeout_secs, 15);
        assert_eq!(config.download.headers.get("Accept").map(String::as_str), Some("*/*"));

        let memory = config.memory_cache_config();
        assert_eq!(memory.count_limit, 200);
        assert_eq!(memory.cost_limit, u64::MAX);
        assert_eq!(memory.age_limit, Duration::from_secs(600));
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();

        assert_eq!(config.disk.inline_threshold, 20 * 1024);
        assert_eq!(config.download.max_concurrent, 6);
        assert_eq!(
            config.download.headers.get("Accept").map(String::as_str),
            Some("image/*;q=0.8")
        );
        let disk = config.disk_store_config();
        assert_eq!(disk.count_limit, u64::MAX);
        assert_eq!(disk.age_limit, Duration::MAX);
    }
}
