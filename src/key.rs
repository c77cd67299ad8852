//! Content-addressed artifact keys
//!
//! A key is the SHA-256 digest of the raw URL string, hex encoded. The same URL
//! always maps to the same key on every instance, so the presence of an object
//! under that name in the store is the cache-hit signal and no separate index
//! is kept.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// File extension of every stored artifact.
pub const ARTIFACT_EXTENSION: &str = "png";

/// Content type sent with every artifact write.
pub const ARTIFACT_CONTENT_TYPE: &str = "image/png";

const KEY_LEN: usize = 64;

/// Lowercase hex SHA-256 digest identifying one screenshot artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactKey(String);

impl ArtifactKey {
    /// Derive the key for `url`. No normalisation is applied: `https://a.com`
    /// and `https://a.com/` are distinct keys.
    pub fn derive(url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Accept an already-derived key, e.g. one read back from a store listing.
    pub fn parse(hex_digest: &str) -> Option<Self> {
        let valid = hex_digest.len() == KEY_LEN
            && hex_digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(hex_digest.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Object name under which the artifact is stored: `<hex>.png`.
    pub fn object_name(&self) -> String {
        format!("{}.{}", self.0, ARTIFACT_EXTENSION)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ArtifactKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
