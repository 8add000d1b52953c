//! Loading and saving `config.toml`.

use super::app_config::{AppConfig, CONFIG_FILE_NAME};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No platform config directory could be determined.
    #[error("failed to determine config directory")]
    ConfigDirNotFound,
    /// Reading or writing the file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serializing the configuration failed.
    #[error("toml serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Reads and writes `config.toml`.
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// Create a new `ConfigLoader` rooted at the platform config directory.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration directory cannot be determined.
    pub fn new() -> Result<Self, ConfigError> {
        AppConfig::default_config_dir()
            .map(|config_dir| Self { config_dir })
            .ok_or(ConfigError::ConfigDirNotFound)
    }

    /// Creates a loader with a specific directory (useful for testing).
    #[must_use]
    pub fn with_dir(path: PathBuf) -> Self {
        Self { config_dir: path }
    }

    /// Returns the configuration directory path.
    #[must_use]
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Loads the application configuration. A missing file is created with
    /// defaults; an unparsable one is reported and replaced by defaults in
    /// memory only.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or created.
    pub fn load_config(&self, path_override: Option<&Path>) -> Result<AppConfig, ConfigError> {
        let path = path_override
            .map_or_else(|| self.config_dir.join(CONFIG_FILE_NAME), Path::to_path_buf);

        if !path.exists() {
            info!(path = %path.display(), "writing default config");
            let config = AppConfig::default();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            Self::save_to_file(&path, &config)?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)?;
        let config = toml::from_str::<AppConfig>(&content).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "unparsable config, using defaults");
            AppConfig::default()
        });
        debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Writes `config` to the default location.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be written.
    pub fn save_config(&self, config: &AppConfig) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.config_dir)?;
        Self::save_to_file(&self.config_dir.join(CONFIG_FILE_NAME), config)
    }

    /// Writes through a temp file in the same directory so a crash never
    /// leaves a truncated config behind.
    fn save_to_file(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(config)?;
        let dir = path
            .parent()
            .ok_or_else(|| std::io::Error::other("config path has no parent"))?;
        let mut staged = tempfile::NamedTempFile::new_in(dir)?;
        staged.write_all(content.as_bytes())?;
        staged.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}
