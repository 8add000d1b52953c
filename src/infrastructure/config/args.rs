//! Command-line arguments.

use super::app_config::LogLevel;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Global options and the subcommand to run.
#[derive(Debug, Parser)]
#[command(
    name = "tiercache",
    version,
    about = "Tiered memory/disk/network cache for images and other artifacts",
    long_about = None
)]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Root directory of the disk cache.
    #[arg(long, value_name = "PATH", global = true, env = "TIERCACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH", global = true)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum, global = true)]
    pub log_level: Option<LogLevel>,

    /// Maximum number of concurrent downloads.
    #[arg(long, global = true)]
    pub max_concurrent: Option<usize>,

    /// Download timeout in seconds.
    #[arg(long, global = true)]
    pub timeout_secs: Option<u64>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load one URL through every tier and report where it came from.
    Fetch {
        /// Resource URL (`http`, `https` or `file`).
        url: String,

        /// Cache key; defaults to the URL.
        #[arg(long)]
        key: Option<String>,

        /// Skip every cache lookup.
        #[arg(long)]
        refresh: bool,

        /// Download even if the URL failed permanently before.
        #[arg(long)]
        retry_failed: bool,

        /// Do not read or write the disk tier.
        #[arg(long)]
        ignore_disk: bool,
    },

    /// Download URLs to the disk tier without decoding them.
    Preload {
        /// Resource URLs.
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Remove cached entries.
    Clear {
        /// Tier to clear.
        #[arg(value_enum, default_value_t = ClearTarget::All)]
        target: ClearTarget,
    },

    /// Print disk tier statistics as JSON.
    Stats,
}

/// Tier selected by `clear`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClearTarget {
    /// In-process tier only.
    Memory,
    /// Disk tier only.
    Disk,
    /// Both tiers.
    All,
}
