use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;

use citadel_edge::{serve, spawn_background_tasks, EdgeConfig, EdgeContext};

#[derive(Parser, Debug)]
#[command(name = "citadel-edge")]
#[command(about = "Content-Security-Policy edge with violation reporting")]
#[command(version)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "CITADEL_EDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    log::info!("Starting Citadel Edge v{}", env!("CARGO_PKG_VERSION"));

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = EdgeConfig::load(cli.config.as_deref())?;
    config.apply_env_overrides()?;
    for warning in config.validate()? {
        log::warn!("{}", warning);
    }

    let ctx = Arc::new(EdgeContext::initialize(config).await?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = spawn_background_tasks(Arc::clone(&ctx), shutdown_rx);

    serve(Arc::clone(&ctx), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for shutdown signal: {}", e);
        }
        log::info!("Shutdown requested");
    })
    .await?;

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            log::warn!("Background task failed: {}", e);
        }
    }
    Ok(())
}
