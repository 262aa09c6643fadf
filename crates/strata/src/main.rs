//! Strata Daemon - periodic tier maintenance over a LanceDB store

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use strata::config::{Config, ConfigManager};
use strata::storage::LanceStore;
use strata::{MaintenanceScheduler, Result, StrataError, TieringService};

/// Strata - tiered memory management for conversational agents
#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Keeps agent memories sorted into weight-driven tiers")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the maintenance and sync timers until interrupted (default command)
    #[command(name = "run")]
    Run,
    /// Run a single maintenance cycle and print its report as JSON
    #[command(name = "maintain")]
    Maintain,
    /// Print tier metrics and capacity alerts as JSON
    #[command(name = "status")]
    Status,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Run) => daemon(cli.config).await,
        Some(Command::Maintain) => maintain(cli.config).await,
        Some(Command::Status) => status(cli.config).await,
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,strata=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    if let Some(path) = config_path {
        return read_config(&path);
    }

    let default_paths = [
        dirs::home_dir().map(|h| h.join(".strata").join("config.toml")),
        dirs::config_dir().map(|c| c.join("strata").join("config.toml")),
        Some(PathBuf::from("config.toml")),
    ];

    for path in default_paths.iter().flatten() {
        if path.exists() {
            return read_config(path);
        }
    }

    tracing::info!("No config file found, using defaults");
    Ok(Config::default())
}

fn read_config(path: &Path) -> Result<Config> {
    tracing::info!("Loading config from: {}", path.display());
    let content = std::fs::read_to_string(path).map_err(|e| {
        StrataError::ConfigInvalid(format!(
            "Failed to read config file {}: {e}",
            path.display()
        ))
    })?;
    toml::from_str(&content)
        .map_err(|e| StrataError::ConfigInvalid(format!("Failed to parse config: {e}")))
}

/// Load config, open storage and wire the service
async fn build_service(config_path: Option<PathBuf>) -> Result<Arc<TieringService>> {
    let config = load_config(config_path)?;
    tracing::debug!("Config loaded: {:?}", config);

    let manager = Arc::new(ConfigManager::new(config.tiering)?);

    let data_dir = &config.storage.data_dir;
    tracing::info!("Initializing storage at: {}", data_dir.display());
    std::fs::create_dir_all(data_dir)?;
    let store = Arc::new(LanceStore::open(data_dir).await?);

    Ok(Arc::new(TieringService::with_store(manager, store)))
}

async fn daemon(config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting Strata daemon");

    let service = build_service(config_path).await?;
    let scheduler = MaintenanceScheduler::new(service).start();

    shutdown_signal().await;
    scheduler.shutdown().await;

    tracing::info!("Strata daemon stopped");
    Ok(())
}

async fn maintain(config_path: Option<PathBuf>) -> Result<()> {
    let service = build_service(config_path).await?;
    let report = service.run_maintenance().await;

    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| StrataError::Serialization(e.to_string()))?;
    println!("{json}");

    if report.has_failures() {
        return Err(StrataError::StoreUnavailable(
            "One or more maintenance stages failed".to_string(),
        ));
    }
    Ok(())
}

async fn status(config_path: Option<PathBuf>) -> Result<()> {
    let service = build_service(config_path).await?;
    let status = service.get_system_status().await?;

    let json = serde_json::to_string_pretty(&status)
        .map_err(|e| StrataError::Serialization(e.to_string()))?;
    println!("{json}");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
