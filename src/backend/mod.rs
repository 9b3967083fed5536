pub mod localfs;
mod multipart;
pub mod oss;
pub mod s3;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::content::ContentStore;
use crate::digest::{BlobDescriptor, BlobDigest};
use crate::errors::BackendError;

use localfs::LocalFsBackend;
use oss::OssBackend;
use s3::S3Backend;

/// Multipart transfers split blobs into chunks of this size unless the
/// backend configuration overrides it: 500 MiB.
pub const MULTIPART_CHUNK_SIZE: u64 = 500 * 1024 * 1024;

/// Closed set of backend type tags, matching the strings accepted by
/// [`new_backend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendType {
    Oss,
    S3,
    LocalFs,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Oss => "oss",
            BackendType::S3 => "s3",
            BackendType::LocalFs => "localfs",
        }
    }
}

impl FromStr for BackendType {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oss" => Ok(BackendType::Oss),
            "s3" => Ok(BackendType::S3),
            "localfs" => Ok(BackendType::LocalFs),
            other => Err(BackendError::UnsupportedType(other.to_string())),
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uploads blobs produced by the image builder to a storage backend.
///
/// Instances hold no per-blob mutable state; concurrent `push`/`check` calls
/// for distinct blobs against one instance are safe.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Pushes the blob named by `desc`, reading bytes from `cs`.
    ///
    /// Safe to call when the object already exists (idempotent overwrite).
    /// Unless the backend was built with `force_push`, an object that is
    /// already present is not re-uploaded. Cancelling `cancel` mid-upload
    /// aborts any in-flight multipart session before returning.
    async fn push(
        &self,
        cancel: &CancellationToken,
        cs: &dyn ContentStore,
        desc: &BlobDescriptor,
    ) -> Result<(), BackendError>;

    /// Checks whether a blob exists in the backend.
    ///
    /// Exists -> `Ok(location)`; absent -> `BackendError::NotFound` (see
    /// [`BackendError::is_not_found`]); anything else is a transport failure.
    async fn check(&self, digest: &BlobDigest) -> Result<String, BackendError>;

    /// The constant backend type tag this instance was constructed with.
    fn kind(&self) -> BackendType;
}

#[derive(Debug, Clone)]
pub enum Backends {
    Oss(OssBackend),
    S3(S3Backend),
    LocalFs(LocalFsBackend),
}

impl Backends {
    /// Returns a reference to the inner value as a trait object.
    pub fn as_trait(&self) -> &dyn Backend {
        match self {
            Backends::Oss(b) => b,
            Backends::S3(b) => b,
            Backends::LocalFs(b) => b,
        }
    }
}

#[async_trait]
impl Backend for Backends {
    async fn push(
        &self,
        cancel: &CancellationToken,
        cs: &dyn ContentStore,
        desc: &BlobDescriptor,
    ) -> Result<(), BackendError> {
        self.as_trait().push(cancel, cs, desc).await
    }

    async fn check(&self, digest: &BlobDigest) -> Result<String, BackendError> {
        self.as_trait().check(digest).await
    }

    fn kind(&self) -> BackendType {
        self.as_trait().kind()
    }
}

/// Constructs a backend from its type tag and an opaque, backend-specific
/// configuration payload. The payload format is only understood by the
/// concrete backend; this factory never inspects it.
///
/// Configuration problems surface here; credentials and connectivity are not
/// validated until the first `check`/`push`.
pub async fn new_backend(
    kind: &str,
    config: &[u8],
    force_push: bool,
) -> Result<Backends, BackendError> {
    match BackendType::from_str(kind)? {
        BackendType::Oss => Ok(Backends::Oss(OssBackend::new(config, force_push)?)),
        BackendType::S3 => Ok(Backends::S3(S3Backend::new(config, force_push).await?)),
        BackendType::LocalFs => Ok(Backends::LocalFs(LocalFsBackend::new(config, force_push)?)),
    }
}
