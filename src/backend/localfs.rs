//! Local-filesystem backend.
//!
//! Blobs land as one file per digest hex under the configured directory.
//! Chunking does not apply here: any size is a single streamed copy. The copy
//! goes to a uniquely-named dot-prefixed temp file first and is renamed into
//! place, so a partially written blob is never visible under its final name.
//! Visibility is POSIX-immediate.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{Backend, BackendType};
use crate::content::ContentStore;
use crate::digest::{BlobDescriptor, BlobDigest};
use crate::errors::BackendError;

const BACKEND: &str = "localfs";

#[derive(Debug, Clone, Deserialize)]
struct LocalFsConfig {
    dir: String,
}

#[derive(Debug, Clone)]
pub struct LocalFsBackend {
    dir: PathBuf,
    force_push: bool,
}

impl LocalFsBackend {
    pub fn new(config: &[u8], force_push: bool) -> Result<Self, BackendError> {
        let config: LocalFsConfig = serde_json::from_slice(config)
            .map_err(|e| BackendError::configuration(BACKEND, e))?;
        if config.dir.is_empty() {
            return Err(BackendError::configuration(BACKEND, "dir must not be empty"));
        }
        Ok(Self {
            dir: PathBuf::from(config.dir),
            force_push,
        })
    }

    fn blob_path(&self, digest: &BlobDigest) -> PathBuf {
        self.dir.join(digest.hex())
    }

    async fn copy_into_place(
        &self,
        cs: &dyn ContentStore,
        desc: &BlobDescriptor,
        target: &Path,
    ) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        // Unique temp name so concurrent pushes of the same digest cannot
        // interleave writes; the rename makes whichever finishes last win
        // with byte-identical content.
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", desc.digest.hex(), Uuid::new_v4()));
        let result = async {
            let mut reader = cs.reader(desc).await?;
            let mut file = fs::File::create(&tmp).await?;
            let written = tokio::io::copy(&mut reader, &mut file).await?;
            if written != desc.size {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "content store produced {written} bytes, descriptor says {}",
                        desc.size
                    ),
                ));
            }
            file.flush().await?;
            fs::rename(&tmp, target).await?;
            Ok(())
        }
        .await;
        if result.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        result
    }
}

#[async_trait]
impl Backend for LocalFsBackend {
    async fn push(
        &self,
        cancel: &CancellationToken,
        cs: &dyn ContentStore,
        desc: &BlobDescriptor,
    ) -> Result<(), BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled {
                backend: BACKEND,
                digest: desc.digest.clone(),
            });
        }
        if !self.force_push {
            match self.check(&desc.digest).await {
                Ok(location) => {
                    tracing::info!(backend = BACKEND, location, "blob already present, skipping copy");
                    return Ok(());
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        let target = self.blob_path(&desc.digest);
        self.copy_into_place(cs, desc, &target)
            .await
            .map_err(|e| BackendError::transport(BACKEND, &desc.digest, e))?;
        tracing::info!(
            backend = BACKEND,
            path = %target.display(),
            size = desc.size,
            "copied blob into place"
        );
        Ok(())
    }

    async fn check(&self, digest: &BlobDigest) -> Result<String, BackendError> {
        let path = self.blob_path(digest);
        match fs::metadata(&path).await {
            Ok(_) => Ok(path.display().to_string()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(BackendError::NotFound {
                backend: BACKEND,
                digest: digest.clone(),
            }),
            Err(err) => Err(BackendError::transport(BACKEND, digest, err)),
        }
    }

    fn kind(&self) -> BackendType {
        BackendType::LocalFs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::DirContentStore;
    use tempfile::tempdir;

    fn descriptor(hex: &str, size: u64) -> BlobDescriptor {
        BlobDescriptor {
            digest: format!("test:{hex}").parse().unwrap(),
            size,
            media_type: "application/octet-stream".to_string(),
        }
    }

    async fn seeded_store(dir: &Path, hex: &str, content: &[u8]) -> DirContentStore {
        fs::write(dir.join(hex), content).await.unwrap();
        DirContentStore::new(dir)
    }

    fn backend(dir: &Path, force_push: bool) -> LocalFsBackend {
        let config = format!(r#"{{"dir":"{}"}}"#, dir.display());
        LocalFsBackend::new(config.as_bytes(), force_push).unwrap()
    }

    #[tokio::test]
    async fn test_push_then_check_round_trip() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let content_dir = tempdir().unwrap();
        let backend_dir = tempdir().unwrap();
        let content = b"layer bytes";
        let cs = seeded_store(content_dir.path(), "aa11", content).await;
        let backend = backend(backend_dir.path(), false);
        let desc = descriptor("aa11", content.len() as u64);

        backend
            .push(&CancellationToken::new(), &cs, &desc)
            .await
            .unwrap();

        let location = backend.check(&desc.digest).await.unwrap();
        assert_eq!(fs::read(&location).await.unwrap(), content);
        // repeated checks are stable
        assert_eq!(backend.check(&desc.digest).await.unwrap(), location);
    }

    #[tokio::test]
    async fn test_check_of_never_pushed_digest_is_not_found() {
        let backend_dir = tempdir().unwrap();
        let backend = backend(backend_dir.path(), false);
        let digest: BlobDigest = "test:beef".parse().unwrap();

        let err = backend.check(&digest).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_zero_length_blob() {
        let content_dir = tempdir().unwrap();
        let backend_dir = tempdir().unwrap();
        let cs = seeded_store(content_dir.path(), "ee00", b"").await;
        let backend = backend(backend_dir.path(), false);
        let desc = descriptor("ee00", 0);

        backend
            .push(&CancellationToken::new(), &cs, &desc)
            .await
            .unwrap();
        let location = backend.check(&desc.digest).await.unwrap();
        assert_eq!(fs::read(&location).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn test_force_push_overwrites_existing_object() {
        let content_dir = tempdir().unwrap();
        let backend_dir = tempdir().unwrap();
        let content = b"same digest, fresh copy";
        let cs = seeded_store(content_dir.path(), "cc22", content).await;
        let backend = backend(backend_dir.path(), true);
        let desc = descriptor("cc22", content.len() as u64);

        // Plant a stale object under the final name; force-push must
        // re-upload even though check would find it.
        fs::write(backend_dir.path().join("cc22"), b"stale")
            .await
            .unwrap();
        assert!(backend.check(&desc.digest).await.is_ok());

        backend
            .push(&CancellationToken::new(), &cs, &desc)
            .await
            .unwrap();
        assert_eq!(
            fs::read(backend_dir.path().join("cc22")).await.unwrap(),
            content
        );
    }

    #[tokio::test]
    async fn test_push_without_force_skips_existing_object() {
        let content_dir = tempdir().unwrap();
        let backend_dir = tempdir().unwrap();
        let cs = seeded_store(content_dir.path(), "dd33", b"new bytes").await;
        let backend = backend(backend_dir.path(), false);
        let desc = descriptor("dd33", 9);

        fs::write(backend_dir.path().join("dd33"), b"already here")
            .await
            .unwrap();
        backend
            .push(&CancellationToken::new(), &cs, &desc)
            .await
            .unwrap();
        // the existing object was left untouched
        assert_eq!(
            fs::read(backend_dir.path().join("dd33")).await.unwrap(),
            b"already here"
        );
    }

    #[tokio::test]
    async fn test_cancelled_push_leaves_no_object() {
        let content_dir = tempdir().unwrap();
        let backend_dir = tempdir().unwrap();
        let cs = seeded_store(content_dir.path(), "ff44", b"never lands").await;
        let backend = backend(backend_dir.path(), false);
        let desc = descriptor("ff44", 11);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = backend.push(&cancel, &cs, &desc).await.unwrap_err();
        assert!(matches!(err, BackendError::Cancelled { .. }));
        assert!(backend.check(&desc.digest).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_size_mismatch_leaves_no_object() {
        let content_dir = tempdir().unwrap();
        let backend_dir = tempdir().unwrap();
        let cs = seeded_store(content_dir.path(), "5511", b"short").await;
        let backend = backend(backend_dir.path(), false);
        // descriptor claims more bytes than the content store holds
        let desc = descriptor("5511", 1000);

        let err = backend
            .push(&CancellationToken::new(), &cs, &desc)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Transport { .. }));
        assert!(backend.check(&desc.digest).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_concurrent_pushes_of_distinct_digests() {
        let content_dir = tempdir().unwrap();
        let backend_dir = tempdir().unwrap();
        let cs_a = seeded_store(content_dir.path(), "0a0a", b"first blob").await;
        let cs_b = seeded_store(content_dir.path(), "0b0b", b"second blob").await;
        let backend = backend(backend_dir.path(), false);
        let desc_a = descriptor("0a0a", 10);
        let desc_b = descriptor("0b0b", 11);

        let cancel = CancellationToken::new();
        let (a, b) = tokio::join!(
            backend.push(&cancel, &cs_a, &desc_a),
            backend.push(&cancel, &cs_b, &desc_b),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(
            fs::read(backend_dir.path().join("0a0a")).await.unwrap(),
            b"first blob"
        );
        assert_eq!(
            fs::read(backend_dir.path().join("0b0b")).await.unwrap(),
            b"second blob"
        );
    }
}
