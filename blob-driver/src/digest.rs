//! Content digests used to address blobs.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest as _, Sha256};

/// The algorithm prefix used for digests computed by this crate.
pub const SHA256: &str = "sha256";

/// Error returned when a string is not a well-formed digest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid digest {input:?}: {reason}")]
pub struct InvalidDigest {
    input: String,
    reason: &'static str,
}

impl InvalidDigest {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_owned(),
            reason,
        }
    }

    /// The string which failed to parse.
    pub fn input(&self) -> &str {
        &self.input
    }
}

/// A content digest of the form `<algorithm>:<hex>`, e.g. `sha256:e3b0c442...`.
///
/// Both components are restricted to lowercase ASCII alphanumerics (the
/// encoded part to hex digits), so a digest can always be used as a path
/// component without escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    repr: String,
    split: usize,
}

impl Digest {
    /// Compute the sha256 digest of some content.
    pub fn sha256(data: &[u8]) -> Self {
        let encoded = hex::encode(Sha256::digest(data));
        Self {
            repr: format!("{SHA256}:{encoded}"),
            split: SHA256.len(),
        }
    }

    /// The algorithm component, e.g. `sha256`.
    pub fn algorithm(&self) -> &str {
        &self.repr[..self.split]
    }

    /// The hex-encoded component.
    pub fn encoded(&self) -> &str {
        &self.repr[self.split + 1..]
    }

    /// The full digest string.
    pub fn as_str(&self) -> &str {
        &self.repr
    }

    /// Check whether `data` hashes to this digest.
    ///
    /// Only sha256 can be verified; other algorithms never match.
    pub fn verify(&self, data: &[u8]) -> bool {
        self.algorithm() == SHA256 && Digest::sha256(data) == *self
    }
}

impl FromStr for Digest {
    type Err = InvalidDigest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, encoded) = s
            .split_once(':')
            .ok_or_else(|| InvalidDigest::new(s, "missing ':' separator"))?;

        if algorithm.is_empty() {
            return Err(InvalidDigest::new(s, "empty algorithm"));
        }
        if !algorithm
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        {
            return Err(InvalidDigest::new(s, "algorithm must be lowercase alphanumeric"));
        }

        if encoded.is_empty() {
            return Err(InvalidDigest::new(s, "empty encoded part"));
        }
        if !encoded
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(InvalidDigest::new(s, "encoded part must be lowercase hex"));
        }

        if algorithm == SHA256 && encoded.len() != 64 {
            return Err(InvalidDigest::new(s, "sha256 digests are 64 hex characters"));
        }

        Ok(Self {
            repr: s.to_owned(),
            split: algorithm.len(),
        })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr)
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.repr
    }
}

impl serde::Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.repr)
    }
}

impl<'de> serde::Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
