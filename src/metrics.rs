use crate::CacheError;
use metrics::{Counter, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

pub const HITS_TOTAL: &str = "screenshot_cache_hits_total";
pub const MISSES_TOTAL: &str = "screenshot_cache_misses_total";
pub const JOINED_TOTAL: &str = "screenshot_cache_joined_total";
pub const GENERATION_FAILURES_TOTAL: &str = "screenshot_cache_generation_failures_total";
pub const STORE_FAILURES_TOTAL: &str = "screenshot_cache_store_failures_total";
pub const GENERATION_SECONDS: &str = "screenshot_cache_generation_seconds";

/// Cache counters, exported through the installed `metrics` recorder and
/// mirrored in atomics for the health endpoint.
///
/// Handles are resolved at construction, so build this after
/// [`PrometheusExporter::install`] or every handle is a no-op.
pub struct CacheMetrics {
    hits: Counter,
    misses: Counter,
    joined: Counter,
    generation_failures: Counter,
    store_failures: Counter,
    generation_duration: Histogram,
    totals: Totals,
}

#[derive(Default)]
struct Totals {
    hits: AtomicU64,
    misses: AtomicU64,
    joined: AtomicU64,
    failures: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            hits: metrics::register_counter!(HITS_TOTAL),
            misses: metrics::register_counter!(MISSES_TOTAL),
            joined: metrics::register_counter!(JOINED_TOTAL),
            generation_failures: metrics::register_counter!(GENERATION_FAILURES_TOTAL),
            store_failures: metrics::register_counter!(STORE_FAILURES_TOTAL),
            generation_duration: metrics::register_histogram!(GENERATION_SECONDS),
            totals: Totals::default(),
        }
    }

    pub fn record_hit(&self) {
        self.hits.increment(1);
        self.totals.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.increment(1);
        self.totals.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_joined(&self) {
        self.joined.increment(1);
        self.totals.joined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_generation(&self, duration: Duration) {
        self.generation_duration.record(duration.as_secs_f64());
    }

    /// Count a request that ended in an error. Invalid input is not a failure of the cache.
    pub fn record_failure(&self, err: &CacheError) {
        match err {
            CacheError::InvalidInput(_) => return,
            CacheError::Generation(_) => self.generation_failures.increment(1),
            CacheError::StoreWrite(_) | CacheError::Configuration(_) => {
                self.store_failures.increment(1)
            }
        }
        self.totals.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.totals.hits.load(Ordering::Relaxed),
            misses: self.totals.misses.load(Ordering::Relaxed),
            joined: self.totals.joined.load(Ordering::Relaxed),
            failures: self.totals.failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub joined: u64,
    pub failures: u64,
}

static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

pub struct PrometheusExporter;

impl PrometheusExporter {
    /// Install the process-wide Prometheus recorder. Repeated calls return the same handle.
    pub fn install() -> Result<PrometheusHandle, CacheError> {
        PROMETHEUS
            .get_or_try_init(|| {
                let handle = PrometheusBuilder::new()
                    .install_recorder()
                    .map_err(|e| CacheError::Configuration(format!("metrics recorder: {e}")))?;
                metrics::describe_counter!(HITS_TOTAL, "Requests answered from the store");
                metrics::describe_counter!(MISSES_TOTAL, "Requests that generated a screenshot");
                metrics::describe_counter!(
                    JOINED_TOTAL,
                    "Requests that awaited an in-flight capture"
                );
                metrics::describe_counter!(GENERATION_FAILURES_TOTAL, "Failed captures");
                metrics::describe_counter!(STORE_FAILURES_TOTAL, "Failed store checks or writes");
                metrics::describe_histogram!(GENERATION_SECONDS, "Capture duration in seconds");
                info!("Prometheus metrics recorder installed");
                Ok(handle)
            })
            .cloned()
    }
}
