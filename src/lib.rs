//! Uploads content-addressed blobs produced by the image builder to a
//! storage backend, skipping content that already exists remotely.
//!
//! Construct a backend with [`new_backend`], test existence with
//! [`Backend::check`], and upload with [`Backend::push`]; large blobs go up
//! through a multipart session with per-part retry and abort-on-failure.

pub mod backend;
pub mod content;
pub mod digest;
pub mod errors;

pub use backend::{new_backend, Backend, BackendType, Backends, MULTIPART_CHUNK_SIZE};
pub use content::{ContentStore, DirContentStore};
pub use digest::{BlobDescriptor, BlobDigest};
pub use errors::BackendError;
