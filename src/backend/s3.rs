//! S3-compatible storage backend.
//!
//! Speaks to AWS proper or to any S3-compatible service behind an explicit
//! endpoint (minio and friends need path-style addressing, so custom
//! endpoints get it). With an empty access keypair the client falls back to
//! the ambient AWS credential chain (environment, profile, instance
//! metadata). New-key read-after-write holds on S3 and compatible services,
//! so a successful push is immediately visible to `check`.

use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::Client as S3Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::backend::{multipart, Backend, BackendType, MULTIPART_CHUNK_SIZE};
use crate::content::ContentStore;
use crate::digest::{BlobDescriptor, BlobDigest};
use crate::errors::BackendError;

const BACKEND: &str = "s3";

fn default_scheme() -> String {
    "https".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct S3Config {
    /// Empty means AWS proper; anything else is an S3-compatible endpoint
    /// host, addressed path-style.
    #[serde(default)]
    endpoint: String,
    #[serde(default = "default_scheme")]
    scheme: String,
    #[serde(default)]
    access_key_id: String,
    #[serde(default)]
    access_key_secret: String,
    region: String,
    bucket_name: String,
    #[serde(default)]
    object_prefix: String,
    #[serde(default)]
    multipart_chunk_size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct S3Backend {
    client: S3Client,
    bucket: String,
    object_prefix: String,
    chunk_size: u64,
    force_push: bool,
}

impl S3Backend {
    pub async fn new(config: &[u8], force_push: bool) -> Result<Self, BackendError> {
        let config: S3Config = serde_json::from_slice(config)
            .map_err(|e| BackendError::configuration(BACKEND, e))?;
        if config.bucket_name.is_empty() {
            return Err(BackendError::configuration(BACKEND, "bucket_name must not be empty"));
        }
        if config.region.is_empty() {
            return Err(BackendError::configuration(BACKEND, "region must not be empty"));
        }
        // Both keys empty means the ambient credential chain; exactly one
        // empty is a misconfigured static keypair.
        if config.access_key_id.is_empty() != config.access_key_secret.is_empty() {
            return Err(BackendError::configuration(
                BACKEND,
                "access_key_id and access_key_secret must be supplied together",
            ));
        }
        let chunk_size = config.multipart_chunk_size.unwrap_or(MULTIPART_CHUNK_SIZE);
        if chunk_size == 0 {
            return Err(BackendError::configuration(BACKEND, "multipart_chunk_size must not be zero"));
        }

        let builder = if config.access_key_id.is_empty() {
            // No static keypair: load the ambient AWS environment.
            let region_provider = RegionProviderChain::first_try(Region::new(config.region.clone()))
                .or_default_provider();
            let base = aws_config::defaults(BehaviorVersion::latest())
                .region(region_provider)
                .load()
                .await;
            Builder::from(&base)
        } else {
            let credentials = Credentials::new(
                config.access_key_id.clone(),
                config.access_key_secret.clone(),
                None,
                None,
                "blobup-config",
            );
            aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .region(Region::new(config.region.clone()))
                .credentials_provider(credentials)
        };
        let builder = if config.endpoint.is_empty() {
            builder
        } else {
            builder
                .endpoint_url(format!("{}://{}", config.scheme, config.endpoint))
                .force_path_style(true)
        };
        let client = S3Client::from_conf(builder.build());

        Ok(Self {
            client,
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
impl Backend for S3Backend {
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
            Ok(_) => Ok(format!("s3://{}/{}", self.bucket, key)),
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
        BackendType::S3
    }
}
