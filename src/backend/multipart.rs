//! Chunked upload engine shared by the S3-wire backends.
//!
//! Blobs at or below the chunk size go up in one `put_object`; larger blobs
//! run a multipart session: initiate, upload consecutive chunk-sized parts in
//! ascending order, then complete with the ordered part list. Every
//! non-success exit aborts the session so no partial object stays visible.
//!
//! The engine talks to the store through the [`ObjectSink`] seam; `S3Client`
//! is the production implementation, tests drive the engine with an
//! in-memory fake.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::content::ContentStore;
use crate::digest::BlobDescriptor;
use crate::errors::BackendError;

const PART_RETRY_ATTEMPTS: u32 = 3;
const PART_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Splits `total` bytes into consecutive part sizes of exactly `chunk` each,
/// with the remainder in the final part. `None` means single-shot: the blob
/// fits in one chunk (or is empty) and multipart must not be initiated.
///
/// An exact multiple of the chunk size yields a full-size final part, never
/// an empty trailing one.
pub(crate) fn plan_parts(total: u64, chunk: u64) -> Option<Vec<u64>> {
    if total <= chunk {
        return None;
    }
    let mut sizes = vec![chunk; (total / chunk) as usize];
    let remainder = total % chunk;
    if remainder > 0 {
        sizes.push(remainder);
    }
    Some(sizes)
}

/// Wire-level failure, tagged with whether another attempt can help
/// (connection drop, timeout, 5xx) or not (auth failure, missing session).
#[derive(Debug)]
pub(crate) struct WireError {
    retryable: bool,
    message: String,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

fn classify<E>(err: SdkError<E>) -> WireError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let retryable = match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(ctx) => ctx.raw().status().as_u16() >= 500,
        _ => false,
    };
    WireError {
        retryable,
        message: DisplayErrorContext(err).to_string(),
    }
}

/// The wire operations the upload engine needs from an object store.
#[async_trait]
pub(crate) trait ObjectSink: Send + Sync {
    async fn put_blob(
        &self,
        bucket: &str,
        key: &str,
        media_type: &str,
        data: Bytes,
    ) -> Result<(), WireError>;

    /// Initiates a multipart session, returning its upload id.
    async fn begin_multipart(&self, bucket: &str, key: &str) -> Result<String, WireError>;

    /// Uploads one part, returning its ETag.
    async fn put_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<String, WireError>;

    /// Assembles the parts, ordered by part number, into the final object.
    async fn finish_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<(i32, String)>,
    ) -> Result<(), WireError>;

    async fn abort_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), WireError>;
}

#[async_trait]
impl ObjectSink for S3Client {
    async fn put_blob(
        &self,
        bucket: &str,
        key: &str,
        media_type: &str,
        data: Bytes,
    ) -> Result<(), WireError> {
        let mut req = self
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data));
        if !media_type.is_empty() {
            req = req.content_type(media_type);
        }
        req.send().await.map_err(classify)?;
        Ok(())
    }

    async fn begin_multipart(&self, bucket: &str, key: &str) -> Result<String, WireError> {
        let out = self
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;
        Ok(out.upload_id().unwrap_or_default().to_string())
    }

    async fn put_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<String, WireError> {
        let out = self
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(classify)?;
        Ok(out.e_tag().unwrap_or_default().to_string())
    }

    async fn finish_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<(i32, String)>,
    ) -> Result<(), WireError> {
        let assembled = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .into_iter()
                    .map(|(part_number, etag)| {
                        CompletedPart::builder()
                            .part_number(part_number)
                            .e_tag(etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();
        self.complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(assembled)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn abort_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), WireError> {
        self.abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }
}

/// One in-flight multipart session. Scoped to a single push; dropped on
/// completion or failure, never persisted or shared across blobs.
struct UploadSession<'a> {
    sink: &'a dyn ObjectSink,
    bucket: &'a str,
    key: &'a str,
    upload_id: String,
    parts: Vec<(i32, String)>,
}

pub(crate) async fn upload(
    sink: &dyn ObjectSink,
    bucket: &str,
    key: &str,
    backend: &'static str,
    chunk_size: u64,
    cancel: &CancellationToken,
    cs: &dyn ContentStore,
    desc: &BlobDescriptor,
) -> Result<(), BackendError> {
    let mut reader = cs
        .reader(desc)
        .await
        .map_err(|e| BackendError::transport(backend, &desc.digest, e))?;

    let Some(part_sizes) = plan_parts(desc.size, chunk_size) else {
        return single_shot(sink, bucket, key, backend, cancel, &mut reader, desc).await;
    };

    let upload_id = sink
        .begin_multipart(bucket, key)
        .await
        .map_err(|e| BackendError::transport(backend, &desc.digest, e))?;
    if upload_id.is_empty() {
        return Err(BackendError::transport(
            backend,
            &desc.digest,
            "backend returned no multipart upload id",
        ));
    }
    tracing::debug!(
        backend,
        key,
        upload_id,
        parts = part_sizes.len(),
        size = desc.size,
        "initiated multipart upload"
    );

    let mut session = UploadSession {
        sink,
        bucket,
        key,
        upload_id,
        parts: Vec::with_capacity(part_sizes.len()),
    };
    match run_session(&mut session, backend, &part_sizes, cancel, &mut reader, desc).await {
        Ok(()) => Ok(()),
        Err(err) => {
            session.abort(backend).await;
            Err(err)
        }
    }
}

async fn run_session(
    session: &mut UploadSession<'_>,
    backend: &'static str,
    part_sizes: &[u64],
    cancel: &CancellationToken,
    reader: &mut (dyn AsyncRead + Send + Unpin),
    desc: &BlobDescriptor,
) -> Result<(), BackendError> {
    for (index, part_size) in part_sizes.iter().enumerate() {
        // Cancellation is observed at part boundaries, not mid-part.
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled {
                backend,
                digest: desc.digest.clone(),
            });
        }
        let part_number = (index + 1) as i32;
        let mut buf = vec![0u8; *part_size as usize];
        reader.read_exact(&mut buf).await.map_err(|e| {
            BackendError::transport_part(
                backend,
                &desc.digest,
                part_number,
                format_args!("content stream ended early: {e}"),
            )
        })?;
        session
            .put_part(backend, part_number, Bytes::from(buf), desc)
            .await?;
    }

    // A token cancelled while the final part was in flight must not yield a
    // completed object.
    if cancel.is_cancelled() {
        return Err(BackendError::Cancelled {
            backend,
            digest: desc.digest.clone(),
        });
    }
    if session.parts.len() != part_sizes.len() {
        return Err(BackendError::Integrity {
            backend,
            digest: desc.digest.clone(),
            expected: part_sizes.len(),
            actual: session.parts.len(),
        });
    }
    session.complete(backend, desc).await?;
    tracing::info!(
        backend,
        key = session.key,
        size = desc.size,
        parts = part_sizes.len(),
        "completed multipart upload"
    );
    Ok(())
}

impl UploadSession<'_> {
    /// Uploads one part, retrying transient wire failures a bounded number of
    /// times with doubling backoff. Permanent failures (auth, missing
    /// session) fail fast; retry exhaustion fails the whole session.
    async fn put_part(
        &mut self,
        backend: &'static str,
        part_number: i32,
        data: Bytes,
        desc: &BlobDescriptor,
    ) -> Result<(), BackendError> {
        let mut attempt = 0;
        let etag = loop {
            attempt += 1;
            match self
                .sink
                .put_part(self.bucket, self.key, &self.upload_id, part_number, data.clone())
                .await
            {
                Ok(etag) => break etag,
                Err(err) if err.retryable && attempt < PART_RETRY_ATTEMPTS => {
                    tracing::warn!(
                        backend,
                        key = self.key,
                        part_number,
                        attempt,
                        error = %err,
                        "part upload failed, retrying"
                    );
                    tokio::time::sleep(PART_RETRY_BASE_DELAY * 2u32.pow(attempt - 1)).await;
                }
                Err(err) => {
                    return Err(BackendError::transport_part(
                        backend,
                        &desc.digest,
                        part_number,
                        err,
                    ));
                }
            }
        };
        tracing::debug!(backend, key = self.key, part_number, "committed part");
        self.parts.push((part_number, etag));
        Ok(())
    }

    async fn complete(
        &mut self,
        backend: &'static str,
        desc: &BlobDescriptor,
    ) -> Result<(), BackendError> {
        // The completion list must be ordered by part index; parts were
        // committed in ascending order so it already is.
        let parts = std::mem::take(&mut self.parts);
        self.sink
            .finish_multipart(self.bucket, self.key, &self.upload_id, parts)
            .await
            .map_err(|e| BackendError::transport(backend, &desc.digest, e))
    }

    /// Releases the session and any uploaded-but-uncommitted parts. Failure
    /// to abort is logged but never masks the primary error.
    async fn abort(&self, backend: &'static str) {
        if let Err(err) = self
            .sink
            .abort_multipart(self.bucket, self.key, &self.upload_id)
            .await
        {
            tracing::warn!(
                backend,
                key = self.key,
                upload_id = self.upload_id,
                error = %err,
                "failed to abort multipart upload session"
            );
        } else {
            tracing::debug!(
                backend,
                key = self.key,
                upload_id = self.upload_id,
                "aborted multipart upload session"
            );
        }
    }
}

async fn single_shot(
    sink: &dyn ObjectSink,
    bucket: &str,
    key: &str,
    backend: &'static str,
    cancel: &CancellationToken,
    reader: &mut (dyn AsyncRead + Send + Unpin),
    desc: &BlobDescriptor,
) -> Result<(), BackendError> {
    if cancel.is_cancelled() {
        return Err(BackendError::Cancelled {
            backend,
            digest: desc.digest.clone(),
        });
    }
    let mut buf = Vec::with_capacity(desc.size as usize);
    reader
        .read_to_end(&mut buf)
        .await
        .map_err(|e| BackendError::transport(backend, &desc.digest, e))?;
    if buf.len() as u64 != desc.size {
        return Err(BackendError::transport(
            backend,
            &desc.digest,
            format_args!(
                "content store produced {} bytes, descriptor says {}",
                buf.len(),
                desc.size
            ),
        ));
    }
    sink.put_blob(bucket, key, &desc.media_type, Bytes::from(buf))
        .await
        .map_err(|e| BackendError::transport(backend, &desc.digest, e))?;
    tracing::info!(backend, key, size = desc.size, "uploaded blob in one shot");
    Ok(())
}
