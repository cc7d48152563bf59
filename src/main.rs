//! CLI Entry Point for power-monitor
//!
//! # Usage
//!
//! Run the monitor until Ctrl-C / SIGTERM:
//! ```bash
//! power-monitor run --config config/power-monitor.toml
//! ```
//!
//! Validate a configuration file and print the effective settings:
//! ```bash
//! power-monitor check-config --config config/power-monitor.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use power_monitor::alerting::LogAlerting;
use power_monitor::config::{MonitorConfig, DEFAULT_CONFIG_PATH};
use power_monitor::logging;
use power_monitor::scheduler::Scheduler;
use power_monitor::service::MonitorService;
use power_monitor::storage::build_storage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "power-monitor")]
#[command(about = "Serial telemetry ingestion for a power-metering MCU", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitor
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Load and validate the configuration, then print it
    CheckConfig {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::CheckConfig { config } => check_config(config),
    }
}

fn load_config(path: &Path) -> Result<MonitorConfig> {
    MonitorConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = load_config(&path)?;
    let rendered =
        toml::to_string_pretty(&config).context("Failed to render effective configuration")?;
    println!("Configuration OK ({})", path.display());
    println!();
    println!("{rendered}");
    Ok(())
}

async fn run(path: PathBuf) -> Result<()> {
    let config = load_config(&path)?;
    logging::init_from_config(&config).context("Failed to initialize logging")?;
    info!(
        name = %config.application.name,
        environment = ?config.application.environment,
        port = %config.serial.port,
        "Starting power monitor"
    );

    let storage = build_storage(&config.storage, &config.measurement)
        .context("Failed to initialize storage")?;
    let service = Arc::new(MonitorService::new(
        config.clone(),
        storage,
        Arc::new(LogAlerting),
    ));
    let scheduler = Scheduler::new(service, &config);

    scheduler.start().await;
    let signal = shutdown_signal().await?;
    scheduler.stop(signal).await;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    Ok("SIGINT")
}
