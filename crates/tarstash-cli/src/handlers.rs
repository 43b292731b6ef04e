//! Command handlers.

use crate::config::{BackendConfig, CliConfig};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;
use tarstash_cache::{
    Cacher, CacherConfig, CompressionType, FilesystemStore, RestoreRequest, S3Store, SaveOutcome,
    SaveRequest,
};
use tarstash_core::ObjectStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type HandlerResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// Build the object store named by the configuration.
pub async fn build_store(config: &CliConfig) -> Arc<dyn ObjectStore> {
    match &config.backend {
        BackendConfig::Filesystem { root } => {
            debug!(root = %root.display(), "using filesystem store");
            Arc::new(FilesystemStore::new(root.clone()))
        }
        BackendConfig::S3 {
            region,
            endpoint,
            force_path_style,
        } => {
            debug!(?region, ?endpoint, "using s3 store");
            Arc::new(S3Store::from_env(region.clone(), endpoint.clone(), *force_path_style).await)
        }
    }
}

fn cacher_config(config: &CliConfig, compression: Option<CompressionType>) -> CacherConfig {
    CacherConfig::default()
        .with_debug(config.debug)
        .with_compression(compression.unwrap_or(config.compression))
}

/// Save a directory under a (possibly templated) key.
pub async fn save(
    config: &CliConfig,
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key: String,
    dir: PathBuf,
    compression: Option<CompressionType>,
    cancel: &CancellationToken,
) -> HandlerResult<SaveOutcome> {
    let cacher = Cacher::new(store, cacher_config(config, compression));
    let key = cacher.expand_key(&key, cancel).await?;
    let outcome = cacher
        .save(&SaveRequest::new(bucket, key.as_str(), dir), cancel)
        .await?;

    match &outcome {
        SaveOutcome::Uploaded { object, stats } => info!(
            key = %key,
            size = object.size,
            entries = stats.entries,
            "saved cache"
        ),
        SaveOutcome::AlreadyCached => debug!(key = %key, "cache already present"),
        SaveOutcome::RaceLost => debug!(key = %key, "cache saved concurrently by another writer"),
    }
    Ok(outcome)
}

/// Restore the best match among `keys`.
pub async fn restore(
    config: &CliConfig,
    store: Arc<dyn ObjectStore>,
    bucket: String,
    keys: Vec<String>,
    dir: PathBuf,
    cancel: &CancellationToken,
) -> HandlerResult {
    let cacher = Cacher::new(store, cacher_config(config, None));
    let mut expanded = Vec::with_capacity(keys.len());
    for key in &keys {
        expanded.push(cacher.expand_key(key, cancel).await?);
    }

    let outcome = cacher
        .restore(&RestoreRequest::new(bucket, expanded, dir), cancel)
        .await?;
    info!(
        object = %outcome.object.name,
        exact = outcome.exact_match,
        entries = outcome.stats.entries,
        "restored cache"
    );
    Ok(())
}

/// Print the digest of the files matching `pattern`.
pub async fn hash_glob(
    config: &CliConfig,
    store: Arc<dyn ObjectStore>,
    pattern: &str,
    cancel: &CancellationToken,
) -> HandlerResult<String> {
    let cacher = Cacher::new(store, cacher_config(config, None));
    Ok(cacher.hash_glob(pattern, cancel).await?)
}

/// Print the digest of `paths`, hashed in order.
pub async fn hash_files(
    config: &CliConfig,
    store: Arc<dyn ObjectStore>,
    paths: Vec<PathBuf>,
    cancel: &CancellationToken,
) -> HandlerResult<String> {
    let cacher = Cacher::new(store, cacher_config(config, None));
    Ok(cacher.hash_files(paths, cancel).await?)
}

/// Show configuration.
pub fn show_config(config: &CliConfig) -> HandlerResult {
    print!("{}", serde_yaml::to_string(config)?);

    if let Ok(path) = CliConfig::config_path() {
        eprintln!("\nConfig file: {}", path.display());
    }

    Ok(())
}

/// Set configuration.
pub fn set_config(key: &str, value: &str) -> HandlerResult {
    let mut config = CliConfig::load().unwrap_or_default();
    config.set(key, value)?;
    config.save()?;

    eprintln!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}
