//! Configuration management with serde serialization/deserialization
//!
//! This module provides all configuration structures for the screenshot cache,
//! including browser settings, the artifact store, and the HTTP server.

use crate::CacheError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Desktop Chrome user agent sent with every page load so sites do not serve
/// their mobile layout to the headless browser.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Main configuration structure for the screenshot cache
///
/// Controls how pages are rendered, where artifacts are stored and how the
/// HTTP service is exposed. Every field has a default, so a configuration file
/// only needs to name what it changes.
///
/// # Examples
///
/// ```rust
/// use screenshot_cache::{Config, StoreBackend};
/// use std::time::Duration;
///
/// let config = Config {
///     navigation_timeout: Duration::from_secs(20),
///     ..Default::default()
/// };
/// assert!(matches!(config.store.backend, StoreBackend::Supabase));
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Browser viewport used for every capture (default: 1280x720)
    pub viewport: Viewport,

    /// User-Agent header sent by the browser (default: desktop Chrome)
    pub user_agent: String,

    /// Hard limit on navigation, including the network-idle wait (default: 15 seconds)
    ///
    /// Exceeding it fails the capture with a navigation timeout and closes the browser.
    pub navigation_timeout: Duration,

    /// When the page counts as loaded after navigation
    pub network_idle: NetworkIdle,

    /// Fixed delay between network idle and capture (default: 500ms)
    ///
    /// Gives client-side frameworks time to paint. Set to zero to capture
    /// as soon as the network settles.
    pub render_settle: Duration,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Launch Chrome with `--single-process` (default: false)
    ///
    /// Required on some serverless and container hosts that cannot fork
    /// renderer processes.
    pub single_process: bool,

    /// Durable artifact store settings
    pub store: StoreConfig,

    /// Cache orchestration settings
    pub cache: CacheSettings,

    /// HTTP server settings
    pub server: ServerConfig,

    /// Deployment environment; production hides diagnostic details from error responses
    pub environment: Environment,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            viewport: Viewport::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            navigation_timeout: Duration::from_secs(15),
            network_idle: NetworkIdle::default(),
            render_settle: Duration::from_millis(500),
            chrome_path: None,
            single_process: false,
            store: StoreConfig::default(),
            cache: CacheSettings::default(),
            server: ServerConfig::default(),
            environment: Environment::Development,
        }
    }
}

impl Config {
    /// Load a configuration file (JSON).
    pub async fn from_file(path: &Path) -> Result<Self, CacheError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            CacheError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Check that the configuration can actually serve requests.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(CacheError::Configuration(
                "Viewport dimensions must be greater than 0".to_string(),
            ));
        }

        if self.navigation_timeout.is_zero() {
            return Err(CacheError::Configuration(
                "Navigation timeout must be greater than 0".to_string(),
            ));
        }

        if self.network_idle.quiet_window.is_zero() {
            return Err(CacheError::Configuration(
                "Network idle window must be greater than 0".to_string(),
            ));
        }

        if self.user_agent.trim().is_empty() {
            return Err(CacheError::Configuration(
                "User agent must not be empty".to_string(),
            ));
        }

        if matches!(self.store.backend, StoreBackend::Supabase) {
            let base_url = self.store.base_url.as_deref().unwrap_or_default();
            if url::Url::parse(base_url).is_err() {
                return Err(CacheError::Configuration(
                    "Store base URL is missing or invalid (set SUPABASE_URL)".to_string(),
                ));
            }
            if self.store.api_key.as_deref().map_or(true, str::is_empty) {
                return Err(CacheError::Configuration(
                    "Store API key is missing (set SUPABASE_SERVICE_ROLE_KEY)".to_string(),
                ));
            }
        }

        if self.store.bucket.is_empty() {
            return Err(CacheError::Configuration(
                "Store bucket must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Browser viewport configuration for screenshots
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1280)
    pub width: u32,

    /// Viewport height in pixels (default: 720)
    pub height: u32,

    /// Device pixel ratio (default: 1.0)
    pub device_scale_factor: f64,

    /// Whether to emulate mobile device (default: false)
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }
}

/// Network-idle criterion for "page loaded"
///
/// The page is considered loaded once no more than `max_inflight` requests
/// have been outstanding for `quiet_window`. The `load` event alone is not
/// enough for client-rendered pages that keep fetching data afterwards.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NetworkIdle {
    /// Tolerated long-lived connections (default: 2)
    pub max_inflight: usize,

    /// How long the network must stay quiet (default: 500ms)
    pub quiet_window: Duration,
}

impl Default for NetworkIdle {
    fn default() -> Self {
        Self {
            max_inflight: 2,
            quiet_window: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Supabase Storage over its REST API
    Supabase,
    /// Process-local map, lost on restart
    Memory,
}

/// Durable artifact store settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Project URL, e.g. `https://abc.supabase.co`
    pub base_url: Option<String>,

    /// Bucket holding the screenshots (default: "screenshots")
    pub bucket: String,

    /// Folder inside the bucket; surrounding slashes are ignored (default: none)
    pub prefix: String,

    /// Service key used for listing and uploads
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Base URL for artifact locations of the memory backend
    pub public_base_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Supabase,
            base_url: None,
            bucket: "screenshots".to_string(),
            prefix: String::new(),
            api_key: None,
            public_base_url: "http://localhost:8080/artifacts".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Let concurrent misses for the same URL share one capture (default: true)
    pub dedupe_in_flight: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dedupe_in_flight: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allow cross-origin requests from the dashboard (default: true)
    pub cors: bool,
    /// Serve Prometheus metrics on `/metrics` (default: true)
    pub metrics: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors: true,
            metrics: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Generate Chrome command-line arguments for headless capture
///
/// # Examples
///
/// ```rust
/// use screenshot_cache::{Config, get_chrome_args};
///
/// let config = Config { single_process: true, ..Default::default() };
/// let args = get_chrome_args(&config);
/// assert!(args.contains(&"--disable-gpu".to_string()));
/// assert!(args.contains(&"--single-process".to_string()));
/// ```
pub fn get_chrome_args(config: &Config) -> Vec<String> {
    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-setuid-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
        "--ignore-certificate-errors".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ),
        format!("--user-agent={}", config.user_agent),
    ];

    if config.single_process {
        args.push("--single-process".to_string());
        args.push("--no-zygote".to_string());
    }

    args
}

/// Browser launch settings for one capture
///
/// Every launch gets its own profile directory; concurrent captures never
/// share browser state.
pub fn create_browser_config(
    config: &Config,
    profile_dir: &Path,
) -> Result<chromiumoxide::browser::BrowserConfig, String> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(config.viewport.width, config.viewport.height)
        .user_data_dir(profile_dir)
        .args(get_chrome_args(config));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build()
}
