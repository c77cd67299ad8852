use super::{ArtifactLocation, ArtifactStore, Presence};
use crate::{ArtifactKey, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredArtifact {
    bytes: Vec<u8>,
    content_type: String,
}

/// Process-local store for development and tests.
#[derive(Debug)]
pub struct MemoryStore {
    public_base_url: String,
    objects: DashMap<String, StoredArtifact>,
}

impl MemoryStore {
    pub fn new(public_base_url: impl Into<String>) -> Self {
        Self {
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            objects: DashMap::new(),
        }
    }

    pub fn read(&self, key: &ArtifactKey) -> Option<Vec<u8>> {
        self.objects
            .get(&key.object_name())
            .map(|stored| stored.bytes.clone())
    }

    pub fn content_type(&self, key: &ArtifactKey) -> Option<String> {
        self.objects
            .get(&key.object_name())
            .map(|stored| stored.content_type.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn exists(&self, key: &ArtifactKey) -> Result<Presence, StoreError> {
        if self.objects.contains_key(&key.object_name()) {
            Ok(Presence::Present)
        } else {
            Ok(Presence::Absent)
        }
    }

    fn resolve(&self, key: &ArtifactKey) -> ArtifactLocation {
        ArtifactLocation::new(format!("{}/{}", self.public_base_url, key.object_name()))
    }

    async fn write(
        &self,
        key: &ArtifactKey,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<ArtifactLocation, StoreError> {
        debug!(key = %key, size = bytes.len(), "Writing artifact to memory store");
        self.objects.insert(
            key.object_name(),
            StoredArtifact {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(self.resolve(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_exists() {
        let store = MemoryStore::new("https://cdn.example.com/shots/");
        let key = ArtifactKey::derive("https://example.com/a");

        assert_eq!(store.exists(&key).await.unwrap(), Presence::Absent);

        let location = store.write(&key, vec![1, 2, 3], "image/png").await.unwrap();
        assert_eq!(
            location.as_str(),
            format!("https://cdn.example.com/shots/{}.png", key)
        );
        assert_eq!(store.exists(&key).await.unwrap(), Presence::Present);
        assert_eq!(store.content_type(&key).as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn test_overwrite_keeps_latest_bytes() {
        let store = MemoryStore::new("http://localhost/artifacts");
        let key = ArtifactKey::derive("https://example.com/a");

        let first = store.write(&key, vec![1], "image/png").await.unwrap();
        let second = store.write(&key, vec![2, 2], "image/png").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.read(&key), Some(vec![2, 2]));
        assert_eq!(store.len(), 1);
    }
}
