use std::fmt;

use thiserror::Error;

use crate::digest::BlobDigest;

#[derive(Debug, Error)]
pub enum BackendError {
    /// Malformed or incomplete backend configuration. Fatal at construction,
    /// never retried.
    #[error("invalid {backend} backend configuration: {reason}")]
    Configuration {
        backend: &'static str,
        reason: String,
    },

    /// Unrecognized backend type tag handed to the factory.
    #[error("unsupported backend type {0}")]
    UnsupportedType(String),

    /// The expected, non-fatal outcome of a `check`: the object is absent and
    /// the caller should proceed to push.
    #[error("blob {digest} not found in {backend} backend")]
    NotFound {
        backend: &'static str,
        digest: BlobDigest,
    },

    /// Network/auth/service failure during `check` or any stage of `push`.
    #[error("{backend} backend transport failure for blob {digest}{part}: {reason}")]
    Transport {
        backend: &'static str,
        digest: BlobDigest,
        part: PartContext,
        reason: String,
    },

    /// The multipart session disagrees with the computed part plan.
    #[error("{backend} multipart upload of {digest} committed {actual} parts, expected {expected}")]
    Integrity {
        backend: &'static str,
        digest: BlobDigest,
        expected: usize,
        actual: usize,
    },

    /// The caller withdrew the operation; any in-flight multipart session has
    /// been aborted.
    #[error("push of blob {digest} to {backend} backend was cancelled")]
    Cancelled {
        backend: &'static str,
        digest: BlobDigest,
    },
}

/// Optional part-number context carried by transport errors, so a failed part
/// upload can be diagnosed without re-deriving session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartContext(pub Option<i32>);

impl fmt::Display for PartContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(n) => write!(f, " (part {n})"),
            None => Ok(()),
        }
    }
}

impl BackendError {
    /// Distinguishes "proceed to push" from "abort, backend unreachable".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn configuration(backend: &'static str, reason: impl fmt::Display) -> Self {
        Self::Configuration {
            backend,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn transport(
        backend: &'static str,
        digest: &BlobDigest,
        reason: impl fmt::Display,
    ) -> Self {
        Self::Transport {
            backend,
            digest: digest.clone(),
            part: PartContext(None),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn transport_part(
        backend: &'static str,
        digest: &BlobDigest,
        part_number: i32,
        reason: impl fmt::Display,
    ) -> Self {
        Self::Transport {
            backend,
            digest: digest.clone(),
            part: PartContext(Some(part_number)),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest() -> BlobDigest {
        "test:cafe".parse().unwrap()
    }

    #[test]
    fn test_not_found_discriminator() {
        let not_found = BackendError::NotFound {
            backend: "s3",
            digest: digest(),
        };
        let transport = BackendError::transport("s3", &digest(), "connection refused");
        assert!(not_found.is_not_found());
        assert!(!transport.is_not_found());
    }

    #[test]
    fn test_transport_message_carries_part_context() {
        let err = BackendError::transport_part("oss", &digest(), 7, "timed out");
        assert_eq!(
            err.to_string(),
            "oss backend transport failure for blob test:cafe (part 7): timed out"
        );
    }
}
