use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestParseError {
    #[error("digest {0:?} is missing an algorithm tag")]
    MissingAlgorithm(String),

    #[error("digest {0:?} has an empty hash payload")]
    EmptyHex(String),

    #[error("digest {0:?} has a non-hex hash payload")]
    InvalidHex(String),

    #[error("digest {digest:?} has wrong hash length for {algorithm} (expected {expected} hex chars)")]
    WrongLength {
        digest: String,
        algorithm: String,
        expected: usize,
    },
}

/// Algorithm-tagged content digest, e.g. `sha256:af12...`.
///
/// The hex payload is the naming basis for remote object keys; two blobs with
/// equal digests are considered identical content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobDigest {
    raw: String,
    // byte offset of the ':' separator within `raw`
    split: usize,
}

impl BlobDigest {
    /// The algorithm tag, e.g. `"sha256"`.
    pub fn algorithm(&self) -> &str {
        &self.raw[..self.split]
    }

    /// The hex hash payload, without the algorithm tag.
    pub fn hex(&self) -> &str {
        &self.raw[self.split + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for BlobDigest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let split = s
            .find(':')
            .ok_or_else(|| DigestParseError::MissingAlgorithm(s.to_string()))?;
        let (algorithm, hex) = (&s[..split], &s[split + 1..]);
        if algorithm.is_empty() {
            return Err(DigestParseError::MissingAlgorithm(s.to_string()));
        }
        if hex.is_empty() {
            return Err(DigestParseError::EmptyHex(s.to_string()));
        }
        if !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(DigestParseError::InvalidHex(s.to_string()));
        }
        let expected = match algorithm {
            "sha256" => Some(64),
            "sha512" => Some(128),
            _ => None,
        };
        if let Some(expected) = expected {
            if hex.len() != expected {
                return Err(DigestParseError::WrongLength {
                    digest: s.to_string(),
                    algorithm: algorithm.to_string(),
                    expected,
                });
            }
        }
        Ok(Self {
            raw: s.to_string(),
            split,
        })
    }
}

impl TryFrom<String> for BlobDigest {
    type Error = DigestParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<BlobDigest> for String {
    fn from(d: BlobDigest) -> String {
        d.raw
    }
}

impl fmt::Display for BlobDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Descriptor of one blob as produced by the image-building pipeline.
/// Read-only to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDescriptor {
    pub digest: BlobDigest,
    pub size: u64,
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA256_HEX: &str = "b5bb9d8014a0f9b1d61e21e796d78dccdf1352f23cd32812f4850b878ae4944c";

    #[test]
    fn test_parse_sha256() {
        let digest: BlobDigest = format!("sha256:{SHA256_HEX}").parse().unwrap();
        assert_eq!(digest.algorithm(), "sha256");
        assert_eq!(digest.hex(), SHA256_HEX);
        assert_eq!(digest.to_string(), format!("sha256:{SHA256_HEX}"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            SHA256_HEX.parse::<BlobDigest>(),
            Err(DigestParseError::MissingAlgorithm(_))
        ));
        assert!(matches!(
            "sha256:".parse::<BlobDigest>(),
            Err(DigestParseError::EmptyHex(_))
        ));
        assert!(matches!(
            "sha256:ZZZZ".parse::<BlobDigest>(),
            Err(DigestParseError::InvalidHex(_))
        ));
        assert!(matches!(
            "sha256:abcd".parse::<BlobDigest>(),
            Err(DigestParseError::WrongLength { .. })
        ));
    }

    #[test]
    fn test_unknown_algorithm_is_accepted() {
        let digest: BlobDigest = "blake3:abcdef0123".parse().unwrap();
        assert_eq!(digest.algorithm(), "blake3");
        assert_eq!(digest.hex(), "abcdef0123");
    }

    #[test]
    fn test_descriptor_json_round_trip() {
        let json = format!(
            r#"{{"digest":"sha256:{SHA256_HEX}","size":42,"mediaType":"application/octet-stream"}}"#
        );
        let desc: BlobDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(desc.size, 42);
        assert_eq!(desc.digest.hex(), SHA256_HEX);
        assert_eq!(desc.media_type, "application/octet-stream");
    }
}
