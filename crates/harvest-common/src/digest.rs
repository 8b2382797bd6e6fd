//! Content digests
//!
//! Canonical documents are compared by the SHA-256 digest of their canonical
//! serialization, so two documents that differ only in key order or statement
//! order produce the same digest.

use sha2::{Digest, Sha256};
use std::fmt;

/// Hex-encoded SHA-256 digest of some content
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Digest an in-memory buffer
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Digest a sequence of parts as if they were concatenated with `separator`
    pub fn of_parts<'a, I>(parts: I, separator: &[u8]) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut hasher = Sha256::new();
        for (i, part) in parts.into_iter().enumerate() {
            if i > 0 {
                hasher.update(separator);
            }
            hasher.update(part);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
