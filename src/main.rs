use clap::Parser;
use pagesnap::{Cli, CliRunner, Settings};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;
    info!("starting pagesnap v{}", env!("CARGO_PKG_VERSION"));

    let settings = load_settings(&args).await?;
    let runner = CliRunner::new(settings).await?;

    let result = tokio::select! {
        result = runner.run(args.command) => {
            info!("command completed");
            result
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            Ok(())
        }
    };

    info!("shutting down");
    runner.shutdown().await;

    if let Err(e) = result {
        error!("command failed: {e}");
        std::process::exit(1);
    }

    info!("pagesnap stopped");
    Ok(())
}

fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::EnvFilter;

    let default_filter = if verbose { "pagesnap=debug,info" } else { "pagesnap=info,warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

async fn load_settings(args: &Cli) -> Result<Settings, Box<dyn std::error::Error>> {
    let mut settings = if let Some(config_path) = &args.config {
        let content = tokio::fs::read_to_string(config_path).await?;
        serde_json::from_str(&content)?
    } else {
        Settings::default()
    };

    if let Some(min) = args.pool_min {
        settings.pool.min_size = min;
    }
    if let Some(max) = args.pool_max {
        settings.pool.max_size = max;
    }
    if let Some(dir) = &args.screenshot_dir {
        settings.screenshot_dir = dir.clone();
    }
    if let Some(path) = &args.browser_path {
        settings.browser_path = Some(path.clone());
    }

    settings.validate()?;
    info!(
        pool_min = settings.pool.min_size,
        pool_max = settings.pool.max_size,
        screenshot_dir = %settings.screenshot_dir,
        "configuration loaded"
    );
    Ok(settings)
}

async fn shutdown_signal() {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to create SIGINT handler");
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to create SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
