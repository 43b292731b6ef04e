//! Save and restore orchestration.
//!
//! `save` checks for the key, opens a create-if-absent writer and streams
//! the compressed archive into it. `restore` resolves the best object among
//! the fallback keys and streams it back into a directory. Archive work runs
//! on the blocking pool; store calls are awaited on the caller's task.

use crate::archiver::{self, ArchiveStats};
use crate::compression::CompressionType;
use crate::config::CacherConfig;
use crate::keys;
use crate::resolver::KeyResolver;
use crate::types::{RestoreOutcome, RestoreRequest, SaveOutcome, SaveRequest};
use std::fmt;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tarstash_core::{
    CancelIo, Error, ErrorKind, ObjectAttrs, ObjectReader, ObjectStore, ObjectWriter, Result,
    ResultExt, cancellable, combine_release,
};
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Saves and restores cached directories against one object store.
pub struct Cacher {
    store: Arc<dyn ObjectStore>,
    config: CacherConfig,
}

impl Cacher {
    pub fn new(store: Arc<dyn ObjectStore>, config: CacherConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CacherConfig {
        &self.config
    }

    fn log(&self, args: fmt::Arguments<'_>) {
        if self.config.debug {
            debug!(store = self.store.name(), "{}", args);
        }
    }

    /// Archive `request.dir` and upload it under `request.key`.
    ///
    /// An existing object for the key is never overwritten: finding one,
    /// either up front or at commit time, is reported as success.
    pub async fn save(
        &self,
        request: &SaveRequest,
        cancel: &CancellationToken,
    ) -> Result<SaveOutcome> {
        request.validate()?;
        let SaveRequest { bucket, key, dir } = request;
        let op = format!("save {}/{}", bucket, key);

        let meta = tokio::fs::metadata(dir)
            .await
            .map_err(|e| Error::io(format!("failed to stat {}", dir.display()), e))
            .context(op.as_str())?;
        if !meta.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "{} is not a directory",
                dir.display()
            )));
        }

        self.log(format_args!("checking if {} already exists", key));
        match cancellable(cancel, self.store.stat(bucket, key)).await {
            Ok(_) => {
                self.log(format_args!("cached object already exists, skipping"));
                return Ok(SaveOutcome::AlreadyCached);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .context("failed to check if cached object exists")
                    .context(op.as_str());
            }
        }

        let attrs = ObjectAttrs::new(self.config.compression.content_type())
            .with_cache_control(self.config.cache_control.as_str());
        self.log(format_args!("creating writer for {}", key));
        let writer = cancellable(cancel, self.store.create(bucket, key, attrs))
            .await
            .context("failed to create object writer")
            .context(op.as_str())?;

        let (writer, archived) = self.archive_into(writer, dir, cancel).await?;

        let stats = match archived {
            Ok(stats) => stats,
            Err(e) => {
                self.log(format_args!("aborting upload"));
                let release = writer.abort().await.context("failed to close writer");
                return combine_release(Err(e), release).context(op.as_str());
            }
        };

        self.log(format_args!("committing {} ({} entries)", key, stats.entries));
        match cancellable(cancel, writer.commit()).await {
            Ok(object) => Ok(SaveOutcome::Uploaded { object, stats }),
            Err(e) if e.is_create_conflict() => {
                self.log(format_args!("{} was created concurrently, skipping", key));
                Ok(SaveOutcome::RaceLost)
            }
            Err(e) => Err(e).context("failed to close writer").context(op.as_str()),
        }
    }

    /// Stream the archive of `dir` into `writer` on the blocking pool and
    /// hand the writer back for commit or abort.
    async fn archive_into(
        &self,
        writer: Box<dyn ObjectWriter>,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(Box<dyn ObjectWriter>, Result<ArchiveStats>)> {
        let compression = self.config.compression;
        let level = self.config.compression_level;
        let buffer_size = self.config.buffer_size;
        let dir = dir.to_path_buf();
        let cancel = cancel.clone();
        let mut bridge = SyncIoBridge::new(CancelIo::new(writer, &cancel));

        let task = tokio::task::spawn_blocking(move || {
            let archived = {
                let mut sink = BufWriter::with_capacity(buffer_size, &mut bridge);
                archiver::create_archive(&mut sink, &dir, compression, level, &cancel).and_then(
                    |stats| {
                        sink.flush()
                            .map_err(|e| Error::io("failed to flush upload", e))?;
                        Ok(stats)
                    },
                )
            };
            (bridge.into_inner().into_inner(), mark_cancelled(archived, &cancel))
        });

        task.await
            .map_err(|e| Error::Internal(format!("archive task failed: {}", e)))
    }

    /// Restore the newest object matching one of `request.keys`.
    pub async fn restore(
        &self,
        request: &RestoreRequest,
        cancel: &CancellationToken,
    ) -> Result<RestoreOutcome> {
        request.validate()?;
        let RestoreRequest { bucket, keys, dir } = request;

        let mut object = KeyResolver::new(self.store.as_ref())
            .with_debug(self.config.debug)
            .resolve(bucket, keys, cancel)
            .await?;
        let op = format!("restore {}/{}", bucket, object.name);

        // Listings may omit attributes; the content type picks the decoder.
        if object.content_type.is_none() {
            object = cancellable(cancel, self.store.stat(bucket, &object.name))
                .await
                .context("failed to read object metadata")
                .context(op.as_str())?;
        }

        self.log(format_args!("making target directory {}", dir.display()));
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::io(format!("failed to make target directory {}", dir.display()), e))
            .context(op.as_str())?;

        let reader = cancellable(cancel, self.store.open(bucket, &object.name))
            .await
            .context("failed to create object reader")
            .context(op.as_str())?;

        let compression = CompressionType::from_content_type(object.content_type.as_deref());
        self.log(format_args!("extracting {} as {}", object.name, compression));
        let (reader, extracted) = self.extract_from(reader, dir, compression, cancel).await?;

        self.log(format_args!("closing reader"));
        let release = reader.close().await.context("failed to close reader");
        let stats = combine_release(extracted, release).context(op.as_str())?;

        let exact_match = keys.iter().any(|k| *k == object.name);
        Ok(RestoreOutcome {
            object,
            exact_match,
            stats,
        })
    }

    async fn extract_from(
        &self,
        reader: Box<dyn ObjectReader>,
        dir: &Path,
        compression: CompressionType,
        cancel: &CancellationToken,
    ) -> Result<(Box<dyn ObjectReader>, Result<ArchiveStats>)> {
        let buffer_size = self.config.buffer_size;
        let dir: PathBuf = dir.to_path_buf();
        let cancel = cancel.clone();
        let mut bridge = SyncIoBridge::new(CancelIo::new(reader, &cancel));

        let task = tokio::task::spawn_blocking(move || {
            let extracted = {
                let source = BufReader::with_capacity(buffer_size, &mut bridge);
                archiver::extract_archive(source, &dir, compression, &cancel)
            };
            (bridge.into_inner().into_inner(), mark_cancelled(extracted, &cancel))
        });

        task.await
            .map_err(|e| Error::Internal(format!("extract task failed: {}", e)))
    }

    /// Hash files in order; see [`keys::hash_files`].
    pub async fn hash_files(&self, paths: Vec<PathBuf>, cancel: &CancellationToken) -> Result<String> {
        self.log(format_args!("hashing {} paths", paths.len()));
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || keys::hash_files(&paths, &cancel))
            .await
            .map_err(|e| Error::Internal(format!("hash task failed: {}", e)))?
    }

    /// Hash the files matched by a glob; see [`keys::hash_glob`].
    pub async fn hash_glob(&self, pattern: &str, cancel: &CancellationToken) -> Result<String> {
        self.log(format_args!("hashing glob {}", pattern));
        let pattern = pattern.to_string();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || keys::hash_glob(&pattern, &cancel))
            .await
            .map_err(|e| Error::Internal(format!("hash task failed: {}", e)))?
    }

    /// Expand hash placeholders in a key template; see [`keys::expand_key`].
    pub async fn expand_key(&self, template: &str, cancel: &CancellationToken) -> Result<String> {
        let template = template.to_string();
        let cancel = cancel.clone();
        let key = tokio::task::spawn_blocking(move || keys::expand_key(&template, &cancel))
            .await
            .map_err(|e| Error::Internal(format!("key task failed: {}", e)))??;
        self.log(format_args!("expanded key to {}", key));
        Ok(key)
    }
}

/// A stream interrupted by cancellation surfaces as whatever codec or I/O
/// error it caused; report it as cancellation instead.
fn mark_cancelled<T>(result: Result<T>, cancel: &CancellationToken) -> Result<T> {
    match result {
        Err(_) if cancel.is_cancelled() => Err(Error::Cancelled),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::fs;

    fn cacher(store: &MemoryStore) -> Cacher {
        Cacher::new(Arc::new(store.clone()), CacherConfig::default().with_debug(true))
    }

    #[tokio::test]
    async fn test_save_then_save_again_is_noop() {
        let store = MemoryStore::new();
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("f"), b"content").unwrap();
        let token = CancellationToken::new();
        let request = SaveRequest::new("b", "k", src.path());

        let first = cacher(&store).save(&request, &token).await.unwrap();
        assert!(matches!(first, SaveOutcome::Uploaded { .. }));
        let second = cacher(&store).save(&request, &token).await.unwrap();
        assert!(matches!(second, SaveOutcome::AlreadyCached));
        assert_eq!(store.object_names("b"), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn test_save_records_content_type_and_cache_control() {
        let store = MemoryStore::new();
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("f"), b"content").unwrap();

        cacher(&store)
            .save(&SaveRequest::new("b", "k", src.path()), &CancellationToken::new())
            .await
            .unwrap();
        let object = store.stat("b", "k").await.unwrap();
        assert_eq!(
            object.content_type.as_deref(),
            Some("application/x-zstd-compressed-tar")
        );
        assert_eq!(object.cache_control.as_deref(), Some("public,max-age=600"));
    }

    #[tokio::test]
    async fn test_save_rejects_missing_fields() {
        let store = MemoryStore::new();
        let err = cacher(&store)
            .save(&SaveRequest::new("b", "", "/tmp"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_save_missing_dir_is_io_error() {
        let store = MemoryStore::new();
        let tmp = tempfile::tempdir().unwrap();
        let err = cacher(&store)
            .save(
                &SaveRequest::new("b", "k", tmp.path().join("missing")),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(store.object_names("b").is_empty());
    }

    #[tokio::test]
    async fn test_restore_missing_key_is_not_found() {
        let store = MemoryStore::new();
        let dest = tempfile::tempdir().unwrap();
        let err = cacher(&store)
            .restore(
                &RestoreRequest::new("b", vec!["nope".into()], dest.path()),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
