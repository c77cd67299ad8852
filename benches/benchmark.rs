use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use screenshot_cache::{
    ArtifactKey, ArtifactStore, CacheService, CacheSettings, GenerationError, MemoryStore,
    ScreenshotGenerator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

/// Generator that never launches a browser; the hit path must not reach it.
struct UnreachableGenerator;

#[async_trait]
impl ScreenshotGenerator for UnreachableGenerator {
    async fn capture(&self, _url: &str) -> Result<Vec<u8>, GenerationError> {
        Err(GenerationError::LaunchFailure(
            "benchmark generator".to_string(),
        ))
    }
}

fn benchmark_key_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_derivation");
    configure_fast_group(&mut group);

    let short = "https://example.com";
    let long = format!("https://example.com/search?q={}", "x".repeat(2000));

    group.bench_function("short_url", |b| {
        b.iter(|| black_box(ArtifactKey::derive(black_box(short))));
    });

    group.bench_function("long_url", |b| {
        b.iter(|| black_box(ArtifactKey::derive(black_box(&long))));
    });

    group.finish();
}

fn benchmark_url_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("url_validation");
    configure_fast_group(&mut group);

    let test_urls = vec![
        "https://example.com",
        "http://example.com/path?query=1",
        "ftp://example.com/file",
        "invalid-url",
    ];

    group.bench_function("validate", |b| {
        b.iter(|| {
            for url in &test_urls {
                let result = screenshot_cache::validate_url(url);
                let _ = black_box(result);
            }
        });
    });

    group.finish();
}

fn benchmark_format_utilities(c: &mut Criterion) {
    let mut group = c.benchmark_group("format_utilities");
    configure_fast_group(&mut group);

    let test_durations = vec![Duration::from_millis(100), Duration::from_secs(5)];
    let test_byte_sizes = vec![1024, 1048576];

    group.bench_function("format_duration", |b| {
        b.iter(|| {
            for duration in &test_durations {
                let formatted = screenshot_cache::format_duration(*duration);
                black_box(formatted);
            }
        });
    });

    group.bench_function("format_bytes", |b| {
        b.iter(|| {
            for size in &test_byte_sizes {
                let formatted = screenshot_cache::format_bytes(*size);
                black_box(formatted);
            }
        });
    });

    group.finish();
}

fn benchmark_cache_hit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("cache_hit");
    configure_fast_group(&mut group);

    let url = "https://example.com";
    let store = Arc::new(MemoryStore::new("https://cdn.example.com/screenshots"));
    rt.block_on(store.write(&ArtifactKey::derive(url), vec![0u8; 1024], "image/png"))
        .unwrap();

    let service = CacheService::new(
        store,
        Arc::new(UnreachableGenerator),
        &CacheSettings::default(),
    );

    group.bench_function("memory_store", |b| {
        b.iter(|| {
            rt.block_on(async {
                let outcome = service.get_or_create(url).await.unwrap();
                black_box(outcome);
            })
        });
    });

    group.finish();
}

criterion_group!(
    unit_benches,
    benchmark_key_derivation,
    benchmark_url_validation,
    benchmark_format_utilities,
    benchmark_cache_hit,
);

criterion_main!(unit_benches);
