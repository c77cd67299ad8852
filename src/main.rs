use clap::Parser;
use screenshot_cache::{setup_logging, Cli, CliRunner, Config};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env must be loaded before clap reads SUPABASE_* from the environment
    let dotenv = dotenvy::dotenv();

    let args = Cli::parse();
    setup_logging(args.verbose, args.json_logs)?;

    info!("Starting screenshot-cache v{}", env!("CARGO_PKG_VERSION"));
    match dotenv {
        Ok(path) => info!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => error!("Failed to read .env file: {}", e),
    }

    let config = load_config(&args).await?;
    let runner = CliRunner::new(config);

    if let Err(e) = runner.run(args.command).await {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path).await?,
        None => Config::default(),
    };

    args.apply_overrides(&mut config);

    info!("Configuration loaded");
    info!("Store backend: {:?}", config.store.backend);
    info!("Navigation timeout: {:?}", config.navigation_timeout);
    info!("Environment: {:?}", config.environment);

    Ok(config)
}
