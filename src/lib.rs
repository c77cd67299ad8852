//! # Screenshot Cache
//!
//! A content-addressed screenshot service. A URL is hashed into an artifact
//! key; if the store already holds `<key>.png` its public location is returned
//! straight away, otherwise a fresh headless Chrome renders the page, the PNG
//! is uploaded with upsert semantics and the new location is returned.
//!
//! ## Request flow
//!
//! | Step | Component | Failure |
//! |------|-----------|---------|
//! | Validate URL | [`validate_url`] | 400 `InvalidInput` |
//! | Derive key | [`ArtifactKey::derive`] | none |
//! | Existence check | [`ArtifactStore::exists`] | credentials → `Configuration`, anything else → miss |
//! | Capture | [`ScreenshotGenerator::capture`] | `Generation` by phase |
//! | Upload | [`ArtifactStore::write`] | `StoreWrite` |
//!
//! Concurrent misses for one URL share a single capture unless
//! `cache.dedupe_in_flight` is turned off.
//!
//! ## Quick Start
//!
//! ```bash
//! SUPABASE_URL=https://abc.supabase.co \
//! SUPABASE_SERVICE_ROLE_KEY=... \
//! screenshot-cache serve --port 8080
//!
//! curl 'http://localhost:8080/screenshot?url=https://example.com'
//! # {"imageUrl":"https://abc.supabase.co/storage/v1/object/public/screenshots/<key>.png"}
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! screenshot-cache --store memory capture --url https://example.com --output example.png
//! screenshot-cache key --url https://example.com
//! screenshot-cache validate --config config.json
//! ```

/// Configuration and settings for the screenshot cache
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Content-addressed artifact keys
pub mod key;

/// Durable artifact stores
pub mod store;

/// Per-call screenshot generation and the browser seam
pub mod capture;

/// Chromium driver for the browser seam
pub mod browser;

/// Lookup-then-generate orchestration
pub mod cache_service;

/// HTTP routes and server lifecycle
pub mod server;

/// Command-line interface implementation
pub mod cli;

/// Cache metrics and the Prometheus exporter
pub mod metrics;

/// Utility functions and helpers
pub mod utils;


pub use browser::*;
pub use cache_service::*;
pub use capture::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use key::*;
pub use metrics::*;
pub use server::*;
pub use store::*;
pub use utils::*;
