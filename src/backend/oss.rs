//! Object-storage-service backend.
//!
//! OSS-style services are addressed through their S3-compatible API with an
//! explicit endpoint and a static access keypair, virtual-hosted bucket
//! addressing. The SDK insists on a region even though the endpoint already
//! pins the target, so a placeholder is supplied. OSS gives read-after-write
//! consistency for new object keys, so a successful push is immediately
//! visible to `check`.

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::Client as S3Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::backend::{multipart, Backend, BackendType, MULTIPART_CHUNK_SIZE};
use crate::content::ContentStore;
use crate::digest::{BlobDescriptor, BlobDigest};
use crate::errors::BackendError;

const BACKEND: &str = "oss";

#[derive(Debug, Clone, Deserialize)]
struct OssConfig {
    /// Endpoint host, e.g. `oss-cn-hangzhou.example.com`; a scheme prefix is
    /// accepted and defaults to https.
    endpoint: String,
    access_key_id: String,
    access_key_secret: String,
    bucket_name: String,
    #[serde(default)]
    object_prefix: String,
    #[serde(default)]
    multipart_chunk_size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct OssBackend {
    client: S3Client,
    bucket: String,
    object_prefix: String,
    chunk_size: u64,
    force_push: bool,
}

impl OssBackend {
    pub fn new(config: &[u8], force_push: bool) -> Result<Self, BackendError> {
        let config: OssConfig = serde_json::from_slice(config)
            .map_err(|e| BackendError::configuration(BACKEND, e))?;
        if config.endpoint.is_empty() {
            return Err(BackendError::configuration(BACKEND, "endpoint must not be empty"));
        }
        if config.bucket_name.is_empty() {
            return Err(BackendError::configuration(BACKEND, "bucket_name must not be empty"));
        }
        if config.access_key_id.is_empty() || config.access_key_secret.is_empty() {
            return Err(BackendError::configuration(
                BACKEND,
                "access_key_id and access_key_secret are required",
            ));
        }
        let chunk_size = config.multipart_chunk_size.unwrap_or(MULTIPART_CHUNK_SIZE);
        if chunk_size == 0 {
            return Err(BackendError::configuration(BACKEND, "multipart_chunk_size must not be zero"));
        }

        let endpoint_url = if config.endpoint.contains("://") {
            config.endpoint.clone()
        } else {
            format!("https://{}", config.endpoint)
        };
        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.access_key_secret.clone(),
            None,
            None,
            "blobup-config",
        );
        let sdk_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("oss"))
            .endpoint_url(endpoint_url)
            .credentials_provider(credentials)
            .build();

        Ok(Self {
            client: S3Client::from_conf(sdk_config),
            bucket: config.bucket_name,
            object_prefix: config.object_prefix,
            chunk_size,
            force_push,
        })
    }

    fn object_key(&self, digest: &BlobDigest) -> String {
        format!("{}{}", self.object_prefix, digest.hex())
    }
}

#[async_trait]
impl Backend for OssBackend {
    async fn push(
        &self,
        cancel: &CancellationToken,
        cs: &dyn ContentStore,
        desc: &BlobDescriptor,
    ) -> Result<(), BackendError> {
        if !self.force_push {
            match self.check(&desc.digest).await {
                Ok(location) => {
                    tracing::info!(backend = BACKEND, location, "blob already present, skipping upload");
                    return Ok(());
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        let key = self.object_key(&desc.digest);
        multipart::upload(
            &self.client,
            &self.bucket,
            &key,
            BACKEND,
            self.chunk_size,
            cancel,
            cs,
            desc,
        )
        .await
    }

    async fn check(&self, digest: &BlobDigest) -> Result<String, BackendError> {
        let key = self.object_key(digest);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(format!("oss://{}/{}", self.bucket, key)),
            Err(SdkError::ServiceError(service_err)) if service_err.err().is_not_found() => {
                Err(BackendError::NotFound {
                    backend: BACKEND,
                    digest: digest.clone(),
                })
            }
            Err(err) => Err(BackendError::transport(
                BACKEND,
                digest,
                DisplayErrorContext(err),
            )),
        }
    }

    fn kind(&self) -> BackendType {
        BackendType::Oss
    }
}
