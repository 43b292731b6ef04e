//! Filesystem-backed object store for local development and shared volumes.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<bucket>/objects/<hex(name)>/data
//! <root>/<bucket>/objects/<hex(name)>/meta.json
//! <root>/<bucket>/uploads/<upload id>/...
//! ```
//!
//! Uploads are staged in their own directory and published by renaming
//! that directory into `objects/`. The rename fails when the target already
//! exists, which gives create-if-absent semantics across processes sharing
//! the root. Names are hex encoded, so a name may contain any character but
//! is limited to half the filesystem's file name length.

use async_trait::async_trait;
use chrono::Utc;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tarstash_core::{
    CacheObject, Error, ObjectAttrs, ObjectReader, ObjectStore, ObjectStream, ObjectWriter, Result,
    UploadId,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::warn;

use crate::keys::matches_prefix;

const OBJECTS_DIR: &str = "objects";
const UPLOADS_DIR: &str = "uploads";
const DATA_FILE: &str = "data";
const META_FILE: &str = "meta.json";

pub struct FilesystemStore {
    root_dir: PathBuf,
}

impl FilesystemStore {
    pub fn new(root_dir: PathBuf) -> Self {
        Self { root_dir }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        let mut components = Path::new(bucket).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root_dir.join(bucket)),
            _ => Err(Error::InvalidArgument(format!(
                "invalid bucket name: {:?}",
                bucket
            ))),
        }
    }

    fn object_dir(&self, bucket: &str, name: &str) -> Result<PathBuf> {
        Ok(self
            .bucket_dir(bucket)?
            .join(OBJECTS_DIR)
            .join(encode_name(name)))
    }
}

impl Default for FilesystemStore {
    fn default() -> Self {
        Self::new(PathBuf::from("/var/tarstash/cache"))
    }
}

fn encode_name(name: &str) -> String {
    hex::encode(name.as_bytes())
}

fn decode_name(encoded: &str) -> Option<String> {
    let bytes = hex::decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

async fn read_meta(object_dir: &Path, bucket: &str, name: &str) -> Result<CacheObject> {
    let path = object_dir.join(META_FILE);
    let raw = match tokio::fs::read(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::NotFound(format!("{}/{}", bucket, name)));
        }
        Err(e) => return Err(Error::io(format!("failed to read {}", path.display()), e)),
    };
    Ok(serde_json::from_slice(&raw)?)
}

#[async_trait]
impl ObjectStore for FilesystemStore {
    async fn stat(&self, bucket: &str, name: &str) -> Result<CacheObject> {
        let object_dir = self.object_dir(bucket, name)?;
        read_meta(&object_dir, bucket, name).await
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<ObjectStream> {
        let objects_dir = self.bucket_dir(bucket)?.join(OBJECTS_DIR);
        let read_dir = match tokio::fs::read_dir(&objects_dir).await {
            Ok(read_dir) => Some(read_dir),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(Error::io(
                    format!("failed to read {}", objects_dir.display()),
                    e,
                ));
            }
        };

        let bucket = bucket.to_string();
        let prefix = prefix.to_string();
        let stream = futures::stream::unfold(read_dir, move |state| {
            let bucket = bucket.clone();
            let prefix = prefix.clone();
            async move {
                let mut read_dir = state?;
                loop {
                    let entry = match read_dir.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => return None,
                        Err(e) => {
                            return Some((Err(Error::io("failed to read object entry", e)), None));
                        }
                    };
                    let Some(name) = entry.file_name().to_str().and_then(decode_name) else {
                        continue;
                    };
                    if !matches_prefix(&name, &prefix) {
                        continue;
                    }
                    match read_meta(&entry.path(), &bucket, &name).await {
                        Ok(object) => return Some((Ok(object), Some(read_dir))),
                        Err(e) => return Some((Err(e), None)),
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn create(
        &self,
        bucket: &str,
        name: &str,
        attrs: ObjectAttrs,
    ) -> Result<Box<dyn ObjectWriter>> {
        let target = self.object_dir(bucket, name)?;
        let staging = self
            .bucket_dir(bucket)?
            .join(UPLOADS_DIR)
            .join(UploadId::new().to_string());
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| Error::io(format!("failed to create {}", staging.display()), e))?;

        let data_path = staging.join(DATA_FILE);
        let file = match tokio::fs::File::create(&data_path).await {
            Ok(file) => file,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                return Err(Error::io(format!("failed to create {}", data_path.display()), e));
            }
        };

        Ok(Box::new(FsWriter {
            file,
            staging,
            target,
            bucket: bucket.to_string(),
            name: name.to_string(),
            attrs,
            size: 0,
            finished: false,
        }))
    }

    async fn open(&self, bucket: &str, name: &str) -> Result<Box<dyn ObjectReader>> {
        let path = self.object_dir(bucket, name)?.join(DATA_FILE);
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(FsReader { file })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("{}/{}", bucket, name)))
            }
            Err(e) => Err(Error::io(format!("failed to open {}", path.display()), e)),
        }
    }

    fn name(&self) -> &str {
        "filesystem"
    }
}

/// Staged upload. The staging directory is removed unless it was published.
struct FsWriter {
    file: tokio::fs::File,
    staging: PathBuf,
    target: PathBuf,
    bucket: String,
    name: String,
    attrs: ObjectAttrs,
    size: u64,
    finished: bool,
}

impl AsyncWrite for FsWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.file).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            self.size += n as u64;
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

#[async_trait]
impl ObjectWriter for FsWriter {
    async fn commit(mut self: Box<Self>) -> Result<CacheObject> {
        self.file
            .flush()
            .await
            .map_err(|e| Error::io(format!("failed to write {}", self.staging.display()), e))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| Error::io(format!("failed to sync {}", self.staging.display()), e))?;

        let object = CacheObject {
            bucket: self.bucket.clone(),
            name: self.name.clone(),
            updated_at: Utc::now(),
            size: self.size,
            content_type: self.attrs.content_type.clone(),
            cache_control: self.attrs.cache_control.clone(),
        };
        let meta_path = self.staging.join(META_FILE);
        tokio::fs::write(&meta_path, serde_json::to_vec_pretty(&object)?)
            .await
            .map_err(|e| Error::io(format!("failed to write {}", meta_path.display()), e))?;

        if let Some(parent) = self.target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(format!("failed to create {}", parent.display()), e))?;
        }

        match tokio::fs::rename(&self.staging, &self.target).await {
            Ok(()) => {
                self.finished = true;
                Ok(object)
            }
            Err(e) => {
                if tokio::fs::try_exists(self.target.join(META_FILE))
                    .await
                    .unwrap_or(false)
                {
                    Err(Error::PreconditionFailed(format!(
                        "{}/{}",
                        self.bucket, self.name
                    )))
                } else {
                    Err(Error::io(
                        format!("failed to publish {}", self.target.display()),
                        e,
                    ))
                }
            }
        }
    }

    async fn abort(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        tokio::fs::remove_dir_all(&self.staging)
            .await
            .map_err(|e| Error::io(format!("failed to remove {}", self.staging.display()), e))
    }
}

impl Drop for FsWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.staging) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.staging.display(), error = %e, "failed to remove staged upload");
            }
        }
    }
}

struct FsReader {
    file: tokio::fs::File,
}

impl AsyncRead for FsReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

#[async_trait]
impl ObjectReader for FsReader {
    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
