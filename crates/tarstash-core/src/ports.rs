//! Port traits for object storage.
//!
//! These traits define the boundary between the cache protocol and the
//! storage adapters. A store only has to offer four primitives: metadata
//! lookup, prefix listing, create-if-absent writes and streamed reads.

use crate::object::{CacheObject, ObjectAttrs};
use crate::Result;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// Lazy, finite listing of objects. It is consumed once and cannot be
/// restarted; the order is whatever the store enumerates.
pub type ObjectStream = Pin<Box<dyn Stream<Item = Result<CacheObject>> + Send>>;

/// Object storage backend.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch metadata for `name`. Absence is reported as a `NotFound` kind
    /// error, distinct from every other failure.
    async fn stat(&self, bucket: &str, name: &str) -> Result<CacheObject>;

    /// List objects whose name starts with `prefix`.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<ObjectStream>;

    /// Open a writer that publishes `name` only if no object exists under it
    /// when the writer is committed.
    async fn create(
        &self,
        bucket: &str,
        name: &str,
        attrs: ObjectAttrs,
    ) -> Result<Box<dyn ObjectWriter>>;

    /// Open a reader over the content of `name`.
    async fn open(&self, bucket: &str, name: &str) -> Result<Box<dyn ObjectReader>>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// Write side of a conditional create.
///
/// Nothing is visible in the store until [`ObjectWriter::commit`] succeeds.
/// A writer dropped without commit discards its upload.
#[async_trait]
pub trait ObjectWriter: AsyncWrite + Send + Unpin {
    /// Publish the object. Fails with a `PreconditionFailed` kind error when
    /// another writer created the same name first.
    async fn commit(self: Box<Self>) -> Result<CacheObject>;

    /// Discard the upload.
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// Read side of a stored object.
#[async_trait]
pub trait ObjectReader: AsyncRead + Send + Unpin {
    /// Release the reader.
    async fn close(self: Box<Self>) -> Result<()>;
}
