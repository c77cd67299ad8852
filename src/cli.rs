use crate::{
    ArtifactKey, ArtifactStore, AppState, BrowserScreenshotGenerator, CacheMetrics,
    CacheService, CaptureSettings, ChromiumDriver, Config, Environment, MemoryStore,
    PrometheusExporter, StoreBackend, SupabaseStore,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "screenshot-cache")]
#[command(about = "Content-addressed screenshot cache backed by headless Chrome")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Navigation timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Launch Chrome with --single-process")]
    pub single_process: bool,

    #[arg(long, value_enum, help = "Artifact store backend")]
    pub store: Option<StoreBackend>,

    #[arg(long, env = "SUPABASE_URL", help = "Supabase project URL")]
    pub supabase_url: Option<String>,

    #[arg(
        long,
        env = "SUPABASE_SERVICE_ROLE_KEY",
        hide_env_values = true,
        help = "Supabase service role key"
    )]
    pub supabase_key: Option<String>,

    #[arg(long, env = "SCREENSHOT_BUCKET", help = "Storage bucket for screenshots")]
    pub bucket: Option<String>,

    #[arg(long, value_enum, env = "SCREENSHOT_ENV", help = "Deployment environment")]
    pub environment: Option<Environment>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Emit logs as JSON")]
    pub json_logs: bool,
}

impl Cli {
    /// Layer command-line and environment settings over a loaded configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(timeout) = self.timeout {
            config.navigation_timeout = Duration::from_secs(timeout);
        }
        if let Some(chrome_path) = &self.chrome_path {
            config.chrome_path = Some(chrome_path.clone());
        }
        if self.single_process {
            config.single_process = true;
        }
        if let Some(backend) = self.store {
            config.store.backend = backend;
        }
        if let Some(url) = &self.supabase_url {
            config.store.base_url = Some(url.clone());
        }
        if let Some(key) = &self.supabase_key {
            config.store.api_key = Some(key.clone());
        }
        if let Some(bucket) = &self.bucket {
            config.store.bucket = bucket.clone();
        }
        if let Some(environment) = self.environment {
            config.environment = environment;
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP service
    Serve {
        #[arg(long, help = "Bind address")]
        host: Option<String>,

        #[arg(short, long, help = "Server port")]
        port: Option<u16>,

        #[arg(long, help = "Disable permissive CORS")]
        no_cors: bool,

        #[arg(long, help = "Disable the Prometheus endpoint")]
        no_metrics: bool,
    },

    /// Resolve one URL through the cache, generating it on a miss
    Capture {
        #[arg(short, long, help = "URL to screenshot")]
        url: String,

        #[arg(short, long, help = "Also write the PNG to this file")]
        output: Option<PathBuf>,
    },

    /// Print the artifact key for a URL
    Key {
        #[arg(short, long, help = "URL to derive the key for")]
        url: String,
    },

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Serve {
                host,
                port,
                no_cors,
                no_metrics,
            } => self.run_server(host, port, no_cors, no_metrics).await,
            Commands::Capture { url, output } => self.run_capture(&url, output).await,
            Commands::Key { url } => {
                let key = ArtifactKey::derive(&url);
                println!("Key:    {key}");
                println!("Object: {}", key.object_name());
                Ok(())
            }
            Commands::Validate { config } => self.validate_config(config).await,
        }
    }

    pub async fn run_server(
        &self,
        host: Option<String>,
        port: Option<u16>,
        no_cors: bool,
        no_metrics: bool,
    ) -> anyhow::Result<()> {
        let mut config = self.config.clone();
        if let Some(host) = host {
            config.server.host = host;
        }
        if let Some(port) = port {
            config.server.port = port;
        }
        config.server.cors &= !no_cors;
        config.server.metrics &= !no_metrics;
        config.validate()?;

        let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
            .parse()
            .context("Invalid server address")?;

        // The recorder must exist before the counters are registered.
        let prometheus = if config.server.metrics {
            Some(PrometheusExporter::install()?)
        } else {
            None
        };

        let (service, _) = build_service(&config)?;
        let mut state = AppState::new(service, config.environment);
        if let Some(handle) = prometheus {
            state = state.with_prometheus(handle);
        }

        crate::server::serve(state, addr, config.server.cors).await
    }

    pub async fn run_capture(&self, url: &str, output: Option<PathBuf>) -> anyhow::Result<()> {
        self.config.validate()?;
        let (service, memory) = build_service(&self.config)?;

        let outcome = service.get_or_create(url).await?;
        println!("Location: {}", outcome.location);
        println!("Key:      {}", outcome.key);
        println!("Status:   {:?}", outcome.status);

        if let Some(output) = output {
            let bytes = match memory.and_then(|store| store.read(&outcome.key)) {
                Some(bytes) => bytes,
                None => reqwest::get(outcome.location.as_str())
                    .await?
                    .error_for_status()?
                    .bytes()
                    .await?
                    .to_vec(),
            };

            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&output, &bytes).await?;
            info!("Screenshot saved to: {}", output.display());
        }

        Ok(())
    }

    pub async fn validate_config(&self, config_path: PathBuf) -> anyhow::Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let config = Config::from_file(&config_path).await?;
        config.validate()?;

        println!("Configuration is valid:");
        println!("  Store: {:?} (bucket {})", config.store.backend, config.store.bucket);
        println!("  Navigation timeout: {:?}", config.navigation_timeout);
        println!(
            "  Viewport: {}x{}",
            config.viewport.width, config.viewport.height
        );
        println!("  Deduplicate in-flight: {}", config.cache.dedupe_in_flight);
        println!("  Environment: {:?}", config.environment);

        Ok(())
    }
}

/// Wire store, browser generator and cache together. The memory store is
/// returned separately so callers can read bytes back without HTTP.
pub fn build_service(config: &Config) -> anyhow::Result<(CacheService, Option<Arc<MemoryStore>>)> {
    let (store, memory): (Arc<dyn ArtifactStore>, Option<Arc<MemoryStore>>) =
        match config.store.backend {
            StoreBackend::Supabase => (Arc::new(SupabaseStore::new(&config.store)?), None),
            StoreBackend::Memory => {
                let memory = Arc::new(MemoryStore::new(config.store.public_base_url.clone()));
                (memory.clone(), Some(memory))
            }
        };

    let generator = BrowserScreenshotGenerator::new(
        ChromiumDriver::new(config.clone()),
        CaptureSettings::from(config),
    );

    let service = CacheService::with_metrics(
        store,
        Arc::new(generator),
        &config.cache,
        Arc::new(CacheMetrics::new()),
    );

    Ok((service, memory))
}

pub fn setup_logging(verbose: bool, json: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{default_level},tower_http={default_level}")));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
    .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}
