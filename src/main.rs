use clap::Parser;
use color_eyre::eyre::{Result, eyre};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use tiercache::application::LoadManager;
use tiercache::domain::{CacheType, LoadOptions, Resource};
use tiercache::infrastructure::config::{ClearTarget, Command};
use tiercache::infrastructure::{AppConfig, CliArgs, ConfigLoader};

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(log_path) = config.effective_log_path() {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

fn load_config(args: &CliArgs) -> Result<AppConfig> {
    let loader = ConfigLoader::new()?;
    let mut config = loader.load_config(args.config.as_deref())?;
    config.merge_with_args(args);
    Ok(config)
}

fn resource(url: &str, key: Option<String>) -> Result<Resource> {
    let resource = Resource::parse(url).map_err(|e| eyre!("invalid url {url}: {e}"))?;
    Ok(match key {
        Some(key) => Resource::new(key, resource.url),
        None => resource,
    })
}

async fn fetch(
    manager: &LoadManager,
    resource: Resource,
    options: LoadOptions,
) -> Result<()> {
    let loaded = manager
        .fetch(resource, options)
        .await
        .ok_or_else(|| eyre!("load cancelled"))??;

    let (width, height) = loaded
        .artifact
        .as_ref()
        .map_or((0, 0), tiercache::domain::Artifact::dimensions);
    let frames = loaded
        .artifact
        .as_ref()
        .and_then(|a| a.as_animated())
        .map_or(1, |a| a.frame_count());
    println!(
        "tier={} size={width}x{height} frames={frames} bytes={}",
        loaded.tier,
        loaded.data.as_ref().map_or(0, bytes::Bytes::len)
    );
    Ok(())
}

async fn preload(manager: &LoadManager, urls: &[String]) -> Result<()> {
    let resources = urls
        .iter()
        .map(|url| resource(url, None))
        .collect::<Result<Vec<_>>>()?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let batch = manager.preload(resources, Some(tx));
    while let Some(progress) = rx.recv().await {
        eprintln!("{}/{} finished", progress.finished, progress.total);
    }
    let summary = batch.finished().await;
    println!("{}", serde_json::to_string(&summary)?);
    if summary.success < summary.total {
        return Err(eyre!(
            "{} of {} preloads failed",
            summary.total - summary.success,
            summary.total
        ));
    }
    Ok(())
}

async fn stats(manager: &LoadManager) -> Result<()> {
    let disk = manager
        .cache()
        .disk_usage()
        .await
        .map(|(count, size)| serde_json::json!({ "count": count, "size": size }));
    let report = serde_json::json!({
        "memory": manager.cache().memory().stats(),
        "disk": disk,
        "disk_error": manager.cache().disk_error(),
        "max_concurrent_downloads": manager.downloader().max_concurrent_downloads(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = CliArgs::parse();
    let config = load_config(&args)?;
    init_logging(&config)?;

    info!(version = tiercache::VERSION, "Starting {}", tiercache::NAME);

    let manager = LoadManager::from_config(&config)?;

    match args.command {
        Command::Fetch {
            url,
            key,
            refresh,
            retry_failed,
            ignore_disk,
        } => {
            let mut options = LoadOptions::empty();
            options.set(LoadOptions::REFRESH_CACHE, refresh);
            options.set(LoadOptions::RETRY_FAILED_URL, retry_failed);
            options.set(LoadOptions::IGNORE_DISK_CACHE, ignore_disk);
            fetch(&manager, resource(&url, key)?, options).await
        }
        Command::Preload { urls } => preload(&manager, &urls).await,
        Command::Clear { target } => {
            let cache_type = match target {
                ClearTarget::Memory => CacheType::MEMORY,
                ClearTarget::Disk => CacheType::DISK,
                ClearTarget::All => CacheType::ALL,
            };
            manager.cache().clear(cache_type).await;
            info!(?target, "cache cleared");
            Ok(())
        }
        Command::Stats => stats(&manager).await,
    }
}
