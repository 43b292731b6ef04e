//! S3-compatible object store (AWS S3, R2, MinIO).
//!
//! Uploads are spooled to a local temporary file. Spools up to
//! [`PART_SIZE`] go up in one `PutObject`; larger ones go up as a multipart
//! upload of `PART_SIZE` parts. Both the put and the final
//! `CompleteMultipartUpload` carry `If-None-Match: *`, so the server rejects
//! a write to a key that already exists. Listings carry no content type;
//! callers needing it stat the object.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::{ByteStream, DateTime as AwsDateTime, Length};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use chrono::{DateTime, Utc};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tarstash_core::{
    CacheObject, Error, ObjectAttrs, ObjectReader, ObjectStore, ObjectStream, ObjectWriter, Result,
};
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, warn};

/// Multipart part size. Spools larger than this are uploaded in parts,
/// which also lifts the 5 GiB single-put limit.
pub const PART_SIZE: u64 = 128_000_000;

#[derive(Clone)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the standard AWS environment, optionally pinned
    /// to a region and a custom endpoint.
    pub async fn from_env(
        region: Option<String>,
        endpoint: Option<String>,
        force_path_style: bool,
    ) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared).force_path_style(force_path_style);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        Self::new(Client::from_conf(builder.build()))
    }
}

fn store_error<E, R>(op: &str, err: SdkError<E, R>) -> Error
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    Error::Store(format!("{}: {}", op, DisplayErrorContext(err)))
}

/// `(offset, length)` of each part of a `size`-byte upload.
fn part_ranges(size: u64, part_size: u64) -> Vec<(u64, u64)> {
    (0..size)
        .step_by(part_size as usize)
        .map(|offset| (offset, part_size.min(size - offset)))
        .collect()
}

fn to_chrono(at: Option<&AwsDateTime>) -> DateTime<Utc> {
    at.and_then(|at| DateTime::from_timestamp(at.secs(), at.subsec_nanos()))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn stat(&self, bucket: &str, name: &str) -> Result<CacheObject> {
        let output = match self
            .client
            .head_object()
            .bucket(bucket)
            .key(name)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => {
                return Err(Error::NotFound(format!("{}/{}", bucket, name)));
            }
            Err(e) => return Err(store_error("head object", e)),
        };

        Ok(CacheObject {
            bucket: bucket.to_string(),
            name: name.to_string(),
            updated_at: to_chrono(output.last_modified()),
            size: output.content_length().unwrap_or(0).max(0) as u64,
            content_type: output.content_type().map(str::to_string),
            cache_control: output.cache_control().map(str::to_string),
        })
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<ObjectStream> {
        let pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();
        let bucket = bucket.to_string();

        let stream = futures::stream::unfold(Some(pages), move |state| {
            let bucket = bucket.clone();
            async move {
                let mut pages = state?;
                match pages.next().await? {
                    Ok(page) => {
                        let objects: Vec<Result<CacheObject>> = page
                            .contents()
                            .iter()
                            .filter_map(|object| {
                                let name = object.key()?;
                                Some(Ok(CacheObject {
                                    bucket: bucket.clone(),
                                    name: name.to_string(),
                                    updated_at: to_chrono(object.last_modified()),
                                    size: object.size().unwrap_or(0).max(0) as u64,
                                    content_type: None,
                                    cache_control: None,
                                }))
                            })
                            .collect();
                        Some((futures::stream::iter(objects), Some(pages)))
                    }
                    Err(e) => Some((
                        futures::stream::iter(vec![Err(store_error("list objects", e))]),
                        None,
                    )),
                }
            }
        });
        Ok(Box::pin(futures::StreamExt::flatten(stream)))
    }

    async fn create(
        &self,
        bucket: &str,
        name: &str,
        attrs: ObjectAttrs,
    ) -> Result<Box<dyn ObjectWriter>> {
        let spool = NamedTempFile::new().map_err(|e| Error::io("failed to create upload spool", e))?;
        let file = spool
            .reopen()
            .map_err(|e| Error::io("failed to open upload spool", e))?;

        Ok(Box::new(S3Writer {
            client: self.client.clone(),
            bucket: bucket.to_string(),
            name: name.to_string(),
            attrs,
            file: tokio::fs::File::from_std(file),
            spool,
            size: 0,
        }))
    }

    async fn open(&self, bucket: &str, name: &str) -> Result<Box<dyn ObjectReader>> {
        let output = match self
            .client
            .get_object()
            .bucket(bucket)
            .key(name)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Err(Error::NotFound(format!("{}/{}", bucket, name)));
            }
            Err(e) => return Err(store_error("get object", e)),
        };

        Ok(Box::new(S3Reader {
            body: Box::pin(output.body.into_async_read()),
        }))
    }

    fn name(&self) -> &str {
        "s3"
    }
}

struct S3Writer {
    client: Client,
    bucket: String,
    name: String,
    attrs: ObjectAttrs,
    file: tokio::fs::File,
    spool: NamedTempFile,
    size: u64,
}

impl AsyncWrite for S3Writer {
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

impl S3Writer {
    /// Map a failed conditional write, reporting a lost race as
    /// `PreconditionFailed`.
    fn put_error<E>(&self, op: &str, err: SdkError<E>) -> Error
    where
        E: std::error::Error + 'static,
    {
        let status = err.raw_response().map(|r| r.status().as_u16());
        if matches!(status, Some(409 | 412)) {
            return Error::PreconditionFailed(format!("{}/{}", self.bucket, self.name));
        }
        store_error(op, err)
    }

    async fn read_spool(&self, offset: u64, length: u64) -> Result<ByteStream> {
        ByteStream::read_from()
            .path(self.spool.path())
            .offset(offset)
            .length(Length::Exact(length))
            .build()
            .await
            .map_err(|e| Error::Store(format!("failed to read upload spool: {}", e)))
    }

    async fn put_single(&self) -> Result<()> {
        let body = ByteStream::from_path(self.spool.path())
            .await
            .map_err(|e| Error::Store(format!("failed to read upload spool: {}", e)))?;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.name)
            .if_none_match("*")
            .body(body);
        if let Some(content_type) = &self.attrs.content_type {
            request = request.content_type(content_type);
        }
        if let Some(cache_control) = &self.attrs.cache_control {
            request = request.cache_control(cache_control);
        }

        request
            .send()
            .await
            .map_err(|e| self.put_error("put object", e))?;
        Ok(())
    }

    async fn put_multipart(&self) -> Result<()> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.name);
        if let Some(content_type) = &self.attrs.content_type {
            request = request.content_type(content_type);
        }
        if let Some(cache_control) = &self.attrs.cache_control {
            request = request.cache_control(cache_control);
        }
        let output = request
            .send()
            .await
            .map_err(|e| store_error("create multipart upload", e))?;
        let upload_id = output
            .upload_id()
            .ok_or_else(|| Error::Store("create multipart upload: no upload id".into()))?;

        let result = self.upload_parts(upload_id).await;
        if result.is_err() {
            if let Err(e) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&self.name)
                .upload_id(upload_id)
                .send()
                .await
            {
                warn!(
                    bucket = %self.bucket,
                    key = %self.name,
                    error = %DisplayErrorContext(e),
                    "failed to abort multipart upload"
                );
            }
        }
        result
    }

    async fn upload_parts(&self, upload_id: &str) -> Result<()> {
        let mut parts = Vec::new();
        for (index, (offset, length)) in part_ranges(self.size, PART_SIZE).into_iter().enumerate() {
            let number = index as i32 + 1;
            debug!(key = %self.name, part = number, offset, length, "uploading part");
            let body = self.read_spool(offset, length).await?;
            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(&self.name)
                .upload_id(upload_id)
                .part_number(number)
                .body(body)
                .send()
                .await
                .map_err(|e| store_error("upload part", e))?;
            parts.push(
                CompletedPart::builder()
                    .part_number(number)
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .build(),
            );
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.name)
            .upload_id(upload_id)
            .if_none_match("*")
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| self.put_error("complete multipart upload", e))?;
        Ok(())
    }
}

#[async_trait]
impl ObjectWriter for S3Writer {
    async fn commit(mut self: Box<Self>) -> Result<CacheObject> {
        self.file
            .flush()
            .await
            .map_err(|e| Error::io("failed to flush upload spool", e))?;

        debug!(bucket = %self.bucket, key = %self.name, size = self.size, "uploading object");
        if self.size > PART_SIZE {
            self.put_multipart().await?;
        } else {
            self.put_single().await?;
        }

        Ok(CacheObject {
            bucket: self.bucket.clone(),
            name: self.name.clone(),
            updated_at: Utc::now(),
            size: self.size,
            content_type: self.attrs.content_type.clone(),
            cache_control: self.attrs.cache_control.clone(),
        })
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        self.spool
            .close()
            .map_err(|e| Error::io("failed to remove upload spool", e))
    }
}

struct S3Reader {
    body: Pin<Box<dyn AsyncRead + Send>>,
}

impl AsyncRead for S3Reader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.body.as_mut().poll_read(cx, buf)
    }
}

#[async_trait]
impl ObjectReader for S3Reader {
    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_conversion() {
        let at = AwsDateTime::from_secs_and_nanos(1_700_000_000, 250);
        let converted = to_chrono(Some(&at));
        assert_eq!(converted.timestamp(), 1_700_000_000);
        assert_eq!(converted.timestamp_subsec_nanos(), 250);
        assert_eq!(to_chrono(None), DateTime::UNIX_EPOCH);
    }

    #[test]
    fn test_part_ranges_cover_upload() {
        assert!(part_ranges(0, 10).is_empty());
        assert_eq!(part_ranges(10, 10), vec![(0, 10)]);
        assert_eq!(part_ranges(25, 10), vec![(0, 10), (10, 10), (20, 5)]);

        let size = 5 * 1024 * 1024 * 1024 + 1;
        let ranges = part_ranges(size, PART_SIZE);
        assert_eq!(ranges.len(), 42);
        assert_eq!(ranges.iter().map(|(_, len)| len).sum::<u64>(), size);
        assert!(ranges.windows(2).all(|w| w[0].0 + w[0].1 == w[1].0));
    }
}
