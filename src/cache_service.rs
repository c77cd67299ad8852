//! Cache orchestration
//!
//! `CacheService` is the only place with real control flow: validate the URL,
//! derive the key, ask the store, and on a miss generate then write. Concurrent
//! misses for the same key share one generation when in-flight deduplication
//! is enabled.
//!
//! # Examples
//!
//! ```rust,no_run
//! use screenshot_cache::{
//!     BrowserScreenshotGenerator, CacheService, CacheSettings, CaptureSettings,
//!     ChromiumDriver, Config, MemoryStore,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let generator = BrowserScreenshotGenerator::new(
//!         ChromiumDriver::new(config.clone()),
//!         CaptureSettings::from(&config),
//!     );
//!     let service = CacheService::new(
//!         Arc::new(MemoryStore::new("http://localhost:8080/artifacts")),
//!         Arc::new(generator),
//!         &CacheSettings::default(),
//!     );
//!
//!     let outcome = service.get_or_create("https://example.com").await?;
//!     println!("{} ({:?})", outcome.location, outcome.status);
//!     Ok(())
//! }
//! ```

use crate::{
    validate_url, ArtifactKey, ArtifactLocation, ArtifactStore, CacheError, CacheMetrics,
    CacheSettings, GenerationError, Presence, ScreenshotGenerator, ARTIFACT_CONTENT_TYPE,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

type SharedGeneration = Shared<BoxFuture<'static, Result<ArtifactLocation, CacheError>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    /// Served from the store without launching a browser.
    Hit,
    /// This request generated and stored the artifact.
    Miss,
    /// Another request was already generating the artifact; this one awaited it.
    Joined,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheOutcome {
    pub key: ArtifactKey,
    pub location: ArtifactLocation,
    pub status: CacheStatus,
}

/// Removes the in-flight entry even if the generation task panics.
struct InFlightGuard {
    in_flight: Arc<DashMap<ArtifactKey, SharedGeneration>>,
    key: ArtifactKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

#[derive(Clone)]
pub struct CacheService {
    store: Arc<dyn ArtifactStore>,
    generator: Arc<dyn ScreenshotGenerator>,
    metrics: Arc<CacheMetrics>,
    in_flight: Arc<DashMap<ArtifactKey, SharedGeneration>>,
    dedupe_in_flight: bool,
}

impl CacheService {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        generator: Arc<dyn ScreenshotGenerator>,
        settings: &CacheSettings,
    ) -> Self {
        Self::with_metrics(store, generator, settings, Arc::new(CacheMetrics::new()))
    }

    pub fn with_metrics(
        store: Arc<dyn ArtifactStore>,
        generator: Arc<dyn ScreenshotGenerator>,
        settings: &CacheSettings,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            store,
            generator,
            metrics,
            in_flight: Arc::new(DashMap::new()),
            dedupe_in_flight: settings.dedupe_in_flight,
        }
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Number of generations currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Return the stored screenshot of `url`, generating it first on a miss.
    pub async fn get_or_create(&self, url: &str) -> Result<CacheOutcome, CacheError> {
        let span = info_span!(
            "get_or_create",
            request_id = %Uuid::new_v4(),
            key = tracing::field::Empty,
        );

        let result = self.lookup_or_generate(url).instrument(span).await;
        if let Err(e) = &result {
            self.metrics.record_failure(e);
        }
        result
    }

    async fn lookup_or_generate(&self, url: &str) -> Result<CacheOutcome, CacheError> {
        validate_url(url)?;

        let key = ArtifactKey::derive(url);
        Span::current().record("key", key.as_str());

        match self.store.exists(&key).await {
            Ok(Presence::Present) => {
                self.metrics.record_hit();
                let location = self.store.resolve(&key);
                debug!(%location, "Cache hit");
                return Ok(CacheOutcome {
                    key,
                    location,
                    status: CacheStatus::Hit,
                });
            }
            Ok(Presence::Absent) => debug!(url, "Cache miss"),
            Ok(Presence::Inconclusive) => {
                warn!(url, "Existence check inconclusive, regenerating")
            }
            Err(e) if e.is_auth_failure() => {
                return Err(CacheError::Configuration(e.to_string()));
            }
            Err(e) => warn!(url, "Existence check failed, regenerating: {}", e),
        }

        if !self.dedupe_in_flight {
            self.metrics.record_miss();
            let location = generate_and_store(
                self.generator.as_ref(),
                self.store.as_ref(),
                &self.metrics,
                &key,
                url,
            )
            .await?;
            return Ok(CacheOutcome {
                key,
                location,
                status: CacheStatus::Miss,
            });
        }

        let (generation, status) = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), CacheStatus::Joined),
            Entry::Vacant(entry) => {
                let generation = self.spawn_generation(key.clone(), url.to_string());
                entry.insert(generation.clone());
                (generation, CacheStatus::Miss)
            }
        };

        match status {
            CacheStatus::Joined => {
                self.metrics.record_joined();
                info!(url, "Joining in-flight capture");
            }
            _ => self.metrics.record_miss(),
        }

        let location = generation.await?;
        Ok(CacheOutcome {
            key,
            location,
            status,
        })
    }

    /// Run generate-then-write on its own task so it completes even if every waiter goes away.
    fn spawn_generation(&self, key: ArtifactKey, url: String) -> SharedGeneration {
        let store = self.store.clone();
        let generator = self.generator.clone();
        let metrics = self.metrics.clone();
        let guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
            key: key.clone(),
        };

        let task = tokio::spawn(
            async move {
                let _guard = guard;
                generate_and_store(generator.as_ref(), store.as_ref(), &metrics, &key, &url).await
            }
            .instrument(Span::current()),
        );

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(CacheError::Generation(GenerationError::CaptureFailure(
                    format!("capture task did not complete: {e}"),
                ))),
            }
        }
        .boxed()
        .shared()
    }
}

async fn generate_and_store(
    generator: &dyn ScreenshotGenerator,
    store: &dyn ArtifactStore,
    metrics: &CacheMetrics,
    key: &ArtifactKey,
    url: &str,
) -> Result<ArtifactLocation, CacheError> {
    let started = Instant::now();
    let bytes = generator.capture(url).await?;
    metrics.record_generation(started.elapsed());

    // A failed write is returned as is; the caller may retry the whole request.
    let location = store
        .write(key, bytes, ARTIFACT_CONTENT_TYPE)
        .await
        .map_err(CacheError::from_store_write)?;

    info!(%location, "Artifact stored");
    Ok(location)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MockScreenshotGenerator;
    use crate::store::MockArtifactStore;
    use crate::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use mockall::Sequence;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const URL: &str = "https://example.com/a";

    fn service(store: MockArtifactStore, generator: MockScreenshotGenerator) -> CacheService {
        CacheService::new(
            Arc::new(store),
            Arc::new(generator),
            &CacheSettings::default(),
        )
    }

    fn location_for(key: &ArtifactKey) -> ArtifactLocation {
        ArtifactLocation::new(format!("https://cdn.example.com/{}", key.object_name()))
    }

    #[tokio::test]
    async fn test_hit_never_generates() {
        let mut store = MockArtifactStore::new();
        store
            .expect_exists()
            .times(1)
            .returning(|_| Ok(Presence::Present));
        store.expect_resolve().returning(location_for);
        store.expect_write().never();

        let mut generator = MockScreenshotGenerator::new();
        generator.expect_capture().never();

        let service = service(store, generator);
        let outcome = service.get_or_create(URL).await.unwrap();

        assert_eq!(outcome.status, CacheStatus::Hit);
        assert_eq!(outcome.key, ArtifactKey::derive(URL));
        assert!(outcome
            .location
            .as_str()
            .ends_with(&format!("{}.png", outcome.key)));
        assert_eq!(service.metrics().snapshot().hits, 1);
    }

    #[tokio::test]
    async fn test_miss_generates_then_writes_once() {
        let mut seq = Sequence::new();
        let mut store = MockArtifactStore::new();
        let mut generator = MockScreenshotGenerator::new();

        store
            .expect_exists()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Presence::Absent));
        generator
            .expect_capture()
            .withf(|url| url == URL)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![0x89, b'P', b'N', b'G']));
        store
            .expect_write()
            .withf(|key, bytes, content_type| {
                *key == ArtifactKey::derive(URL) && bytes.len() == 4 && content_type == "image/png"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|key, _, _| Ok(location_for(key)));

        let service = service(store, generator);
        let outcome = service.get_or_create(URL).await.unwrap();

        assert_eq!(outcome.status, CacheStatus::Miss);
        assert_eq!(outcome.location, location_for(&ArtifactKey::derive(URL)));
        assert_eq!(service.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_auth_failure_short_circuits() {
        let mut store = MockArtifactStore::new();
        store.expect_exists().returning(|_| {
            Err(StoreError::Unauthorized {
                status: 403,
                message: "invalid signature".to_string(),
            })
        });
        store.expect_write().never();

        let mut generator = MockScreenshotGenerator::new();
        generator.expect_capture().never();

        let service = service(store, generator);
        let err = service.get_or_create(URL).await.unwrap_err();

        assert!(matches!(err, CacheError::Configuration(_)));
        assert!(!err.is_retryable());
        assert_eq!(service.metrics().snapshot().failures, 1);
    }

    #[tokio::test]
    async fn test_inconclusive_check_is_a_miss() {
        let mut store = MockArtifactStore::new();
        store
            .expect_exists()
            .returning(|_| Err(StoreError::Transport("connection reset".to_string())));
        store
            .expect_write()
            .times(1)
            .returning(|key, _, _| Ok(location_for(key)));

        let mut generator = MockScreenshotGenerator::new();
        generator
            .expect_capture()
            .times(1)
            .returning(|_| Ok(vec![1]));

        let outcome = service(store, generator).get_or_create(URL).await.unwrap();
        assert_eq!(outcome.status, CacheStatus::Miss);
    }

    #[tokio::test]
    async fn test_generation_failure_skips_write() {
        let mut store = MockArtifactStore::new();
        store.expect_exists().returning(|_| Ok(Presence::Absent));
        store.expect_write().never();

        let mut generator = MockScreenshotGenerator::new();
        generator
            .expect_capture()
            .returning(|_| Err(GenerationError::PageLoad { status: 404 }));

        let err = service(store, generator).get_or_create(URL).await.unwrap_err();

        assert_eq!(
            err,
            CacheError::Generation(GenerationError::PageLoad { status: 404 })
        );
        assert!(err.is_retryable());
        assert_eq!(err.http_status(), 500);
    }

    #[tokio::test]
    async fn test_write_failure_is_not_retried() {
        let mut store = MockArtifactStore::new();
        store.expect_exists().returning(|_| Ok(Presence::Absent));
        store.expect_write().times(1).returning(|_, _, _| {
            Err(StoreError::Rejected {
                status: 413,
                message: "Payload too large".to_string(),
            })
        });

        let mut generator = MockScreenshotGenerator::new();
        generator
            .expect_capture()
            .times(1)
            .returning(|_| Ok(vec![1, 2, 3]));

        let err = service(store, generator).get_or_create(URL).await.unwrap_err();
        assert!(matches!(err, CacheError::StoreWrite(_)));
    }

    #[tokio::test]
    async fn test_write_auth_failure_is_configuration_error() {
        let mut store = MockArtifactStore::new();
        store.expect_exists().returning(|_| Ok(Presence::Absent));
        store.expect_write().returning(|_, _, _| {
            Err(StoreError::Unauthorized {
                status: 403,
                message: "new row violates row-level security policy".to_string(),
            })
        });

        let mut generator = MockScreenshotGenerator::new();
        generator.expect_capture().returning(|_| Ok(vec![1]));

        let err = service(store, generator).get_or_create(URL).await.unwrap_err();
        assert!(matches!(err, CacheError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_invalid_url_does_no_io() {
        let mut store = MockArtifactStore::new();
        store.expect_exists().never();
        let mut generator = MockScreenshotGenerator::new();
        generator.expect_capture().never();

        let err = service(store, generator)
            .get_or_create("not-a-url")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CacheError::InvalidInput("Invalid URL format provided".to_string())
        );
    }

    struct SlowGenerator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ScreenshotGenerator for SlowGenerator {
        async fn capture(&self, _url: &str) -> Result<Vec<u8>, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(vec![7; 16])
        }
    }

    fn concurrent_service(dedupe_in_flight: bool) -> (CacheService, Arc<SlowGenerator>) {
        let generator = Arc::new(SlowGenerator {
            calls: AtomicUsize::new(0),
        });
        let service = CacheService::new(
            Arc::new(MemoryStore::new("http://localhost/artifacts")),
            generator.clone(),
            &CacheSettings { dedupe_in_flight },
        );
        (service, generator)
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_capture() {
        let (service, generator) = concurrent_service(true);

        let (a, b) = tokio::join!(service.get_or_create(URL), service.get_or_create(URL));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.location, b.location);
        let mut statuses = vec![a.status, b.status];
        statuses.sort_by_key(|s| *s as u8);
        assert_eq!(statuses, vec![CacheStatus::Miss, CacheStatus::Joined]);
        assert_eq!(service.in_flight(), 0);

        let again = service.get_or_create(URL).await.unwrap();
        assert_eq!(again.status, CacheStatus::Hit);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dedupe_disabled_generates_independently() {
        let (service, generator) = concurrent_service(false);

        let (a, b) = tokio::join!(service.get_or_create(URL), service.get_or_create(URL));

        assert_eq!(a.unwrap().status, CacheStatus::Miss);
        assert_eq!(b.unwrap().status, CacheStatus::Miss);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }
}
