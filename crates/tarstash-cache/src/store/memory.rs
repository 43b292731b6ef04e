//! In-process object store.
//!
//! Objects live in a map behind a mutex shared by every clone of the store,
//! so several cachers holding clones behave like independent processes
//! sharing one bucket. Used by tests and for dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tarstash_core::{
    CacheObject, Error, ObjectAttrs, ObjectReader, ObjectStore, ObjectStream, ObjectWriter, Result,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Failures to inject into writers and readers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Faults {
    /// Every write to an object writer fails.
    pub fail_writes: bool,
    /// `abort` on writers and `close` on readers fail.
    pub fail_release: bool,
}

#[derive(Debug, Clone)]
struct StoredObject {
    meta: CacheObject,
    data: Arc<Vec<u8>>,
}

#[derive(Debug, Default)]
struct State {
    buckets: HashMap<String, BTreeMap<String, StoredObject>>,
    faults: Faults,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: Faults) -> Self {
        let store = Self::new();
        store.lock().faults = faults;
        store
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves the map itself consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Place an object directly, with an explicit update time.
    pub fn insert(&self, bucket: &str, name: &str, data: Vec<u8>, updated_at: DateTime<Utc>) {
        let meta = CacheObject {
            bucket: bucket.to_string(),
            name: name.to_string(),
            updated_at,
            size: data.len() as u64,
            content_type: None,
            cache_control: None,
        };
        self.insert_object(meta, data);
    }

    /// Place an object with full metadata.
    pub fn insert_object(&self, meta: CacheObject, data: Vec<u8>) {
        self.lock()
            .buckets
            .entry(meta.bucket.clone())
            .or_default()
            .insert(
                meta.name.clone(),
                StoredObject {
                    meta,
                    data: Arc::new(data),
                },
            );
    }

    /// Names of all objects in `bucket`, sorted.
    pub fn object_names(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Raw content of an object.
    pub fn object_data(&self, bucket: &str, name: &str) -> Option<Vec<u8>> {
        self.lock()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(name))
            .map(|object| object.data.as_ref().clone())
    }

    fn get(&self, bucket: &str, name: &str) -> Result<StoredObject> {
        self.lock()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(name))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{}/{}", bucket, name)))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn stat(&self, bucket: &str, name: &str) -> Result<CacheObject> {
        Ok(self.get(bucket, name)?.meta)
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<ObjectStream> {
        let matches: Vec<Result<CacheObject>> = self
            .lock()
            .buckets
            .get(bucket)
            .map(|objects| {
                objects
                    .range(prefix.to_string()..)
                    .take_while(|(name, _)| name.starts_with(prefix))
                    .map(|(_, object)| Ok(object.meta.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(futures::stream::iter(matches).boxed())
    }

    async fn create(
        &self,
        bucket: &str,
        name: &str,
        attrs: ObjectAttrs,
    ) -> Result<Box<dyn ObjectWriter>> {
        let faults = self.lock().faults;
        Ok(Box::new(MemoryWriter {
            store: self.clone(),
            bucket: bucket.to_string(),
            name: name.to_string(),
            attrs,
            buf: Vec::new(),
            faults,
        }))
    }

    async fn open(&self, bucket: &str, name: &str) -> Result<Box<dyn ObjectReader>> {
        let object = self.get(bucket, name)?;
        let faults = self.lock().faults;
        Ok(Box::new(MemoryReader {
            data: object.data,
            pos: 0,
            faults,
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct MemoryWriter {
    store: MemoryStore,
    bucket: String,
    name: String,
    attrs: ObjectAttrs,
    buf: Vec<u8>,
    faults: Faults,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.faults.fail_writes {
            return Poll::Ready(Err(io::Error::other("injected write failure")));
        }
        self.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl ObjectWriter for MemoryWriter {
    async fn commit(self: Box<Self>) -> Result<CacheObject> {
        let this = *self;
        let mut state = this.store.lock();
        let objects = state.buckets.entry(this.bucket.clone()).or_default();
        if objects.contains_key(&this.name) {
            return Err(Error::PreconditionFailed(format!(
                "{}/{}",
                this.bucket, this.name
            )));
        }
        let meta = CacheObject {
            bucket: this.bucket,
            name: this.name.clone(),
            updated_at: Utc::now(),
            size: this.buf.len() as u64,
            content_type: this.attrs.content_type,
            cache_control: this.attrs.cache_control,
        };
        objects.insert(
            this.name,
            StoredObject {
                meta: meta.clone(),
                data: Arc::new(this.buf),
            },
        );
        Ok(meta)
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        if self.faults.fail_release {
            return Err(Error::Store("injected abort failure".into()));
        }
        Ok(())
    }
}

struct MemoryReader {
    data: Arc<Vec<u8>>,
    pos: usize,
    faults: Faults,
}

impl AsyncRead for MemoryReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let remaining = &self.data[self.pos..];
        let n = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..n]);
        self.pos += n;
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl ObjectReader for MemoryReader {
    async fn close(self: Box<Self>) -> Result<()> {
        if self.faults.fail_release {
            return Err(Error::Store("injected close failure".into()));
        }
        Ok(())
    }
}
