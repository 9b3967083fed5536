use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncRead;

use crate::digest::BlobDescriptor;

/// Read-only source of local blob bytes, owned by the caller and borrowed for
/// the duration of a push.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Opens a readable byte stream for the descriptor's content.
    async fn reader(
        &self,
        desc: &BlobDescriptor,
    ) -> io::Result<Box<dyn AsyncRead + Send + Unpin>>;
}

/// A `ContentStore` backed by a directory holding one file per blob, named by
/// the digest hex. This is the layout the image builder writes.
#[derive(Clone, Debug)]
pub struct DirContentStore {
    root: PathBuf,
}

impl DirContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn blob_path(&self, desc: &BlobDescriptor) -> PathBuf {
        self.root.join(desc.digest.hex())
    }
}

#[async_trait]
impl ContentStore for DirContentStore {
    async fn reader(
        &self,
        desc: &BlobDescriptor,
    ) -> io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        let file = fs::File::open(self.blob_path(desc)).await?;
        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    fn descriptor(hex: &str, size: u64) -> BlobDescriptor {
        BlobDescriptor {
            digest: format!("test:{hex}").parse().unwrap(),
            size,
            media_type: String::new(),
        }
    }

    #[tokio::test]
    async fn test_dir_content_store_reads_blob_file() {
        let temp_dir = tempdir().unwrap();
        let content = b"blob bytes";
        tokio::fs::write(temp_dir.path().join("abc123"), content)
            .await
            .unwrap();

        let store = DirContentStore::new(temp_dir.path());
        let desc = descriptor("abc123", content.len() as u64);

        let mut reader = store.reader(&desc).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, content);
    }

    #[tokio::test]
    async fn test_missing_blob_is_an_io_error() {
        let temp_dir = tempdir().unwrap();
        let store = DirContentStore::new(temp_dir.path());
        let desc = descriptor("deadbeef", 4);

        let err = store.reader(&desc).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
