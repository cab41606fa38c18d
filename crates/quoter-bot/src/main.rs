//! quoter: active two-sided quoting engine for binary prediction markets.
//!
//! Usage:
//!   quoter [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Config file path (default: config/quoter.toml)
//!   --dry-run                Log side-effectful calls instead of sending them
//!   --detect-only            Run the quote cycle but never place orders
//!   --assets <ASSETS>        Comma-separated token IDs (overrides config)
//!   --log-level <LEVEL>      trace|debug|info|warn|error
//!
//! Exit codes: 0 normal, 1 fatal config error, 2 unrecoverable halt on
//! startup.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use quoter_bot::orchestrator::{Orchestrator, StartupError};
use quoter_bot::QuoterConfig;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "quoter")]
#[command(about = "Active two-sided quoting engine for binary prediction markets")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/quoter.toml")]
    config: PathBuf,

    /// Log side-effectful calls instead of sending them
    #[arg(long)]
    dry_run: bool,

    /// Run the quote cycle but never place orders
    #[arg(long)]
    detect_only: bool,

    /// Comma-separated token IDs to quote (overrides config)
    #[arg(long, value_delimiter = ',')]
    assets: Option<Vec<String>>,

    /// Logging level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    init_logging(&config.log_level);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal: {:#}", e);
            if e.downcast_ref::<StartupError>().is_some() {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}

fn load_config(args: &Args) -> Result<QuoterConfig> {
    // Load environment variables from .env if present.
    if let Err(e) = dotenvy::dotenv()
        && !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
    {
        eprintln!("Warning: failed to load .env file: {}", e);
    }

    let mut config = if args.config.exists() {
        QuoterConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?
    } else {
        eprintln!(
            "Config file not found at {:?}, using defaults",
            args.config
        );
        QuoterConfig::default()
    };

    config.apply_env_overrides();
    config.apply_cli_overrides(
        args.dry_run,
        args.detect_only,
        args.assets.clone(),
        args.log_level.clone(),
    );
    config.validate().context("Configuration validation failed")?;

    Ok(config)
}

fn init_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Warning: tracing subscriber already set");
    }
}

async fn run(config: QuoterConfig) -> Result<()> {
    info!(
        assets = ?config.assets,
        dry_run = config.dry_run,
        detect_only = config.detect_only,
        "Starting quoter"
    );

    let mut orchestrator = Orchestrator::new(config).context("Failed to build orchestrator")?;

    // Shutdown on SIGINT/SIGTERM.
    let shutdown = orchestrator.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            error!("Signal handler error: {}", e);
        }
        info!("Requesting shutdown...");
        let _ = shutdown.send(());
    });

    orchestrator.run().await
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
