//! Durable artifact storage
//!
//! The cache never serves image bytes itself. A store persists the PNG under
//! its content-addressed name and hands back a location clients fetch from
//! directly.

use crate::{ArtifactKey, StoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod memory;
pub mod supabase;

pub use memory::MemoryStore;
pub use supabase::SupabaseStore;

/// Externally resolvable URL of a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactLocation(String);

impl ArtifactLocation {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ArtifactLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of an existence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// The artifact is listed by the store and can be fetched.
    Present,
    /// The store answered and the artifact is not there.
    Absent,
    /// The store could not give a trustworthy answer; callers treat this as a miss.
    Inconclusive,
}

/// Interface over a durable blob store
///
/// `resolve` only builds a URL and proves nothing; a hit must always come
/// from `exists`. Credential failures are returned as errors from `exists`
/// and `write` (see [`StoreError::is_auth_failure`]) so they are never
/// mistaken for a missing artifact.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn exists(&self, key: &ArtifactKey) -> Result<Presence, StoreError>;

    fn resolve(&self, key: &ArtifactKey) -> ArtifactLocation;

    /// Store `bytes` under `key`, replacing any previous content.
    async fn write(
        &self,
        key: &ArtifactKey,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<ArtifactLocation, StoreError>;
}
