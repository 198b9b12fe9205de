//! Common utilities for all binaries
//!
//! Shared initialization, CLI parsing, and setup code.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tether_core::connection::SupervisorStatus;
use tether_core::TetherConfig;
use tokio::sync::watch;

/// Common CLI arguments for all binaries
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    /// TOML configuration file (environment overrides still apply)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level, overrides monitoring.log_level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    pub json_logs: bool,
}

/// Load configuration and apply CLI overrides
pub fn load_config(args: &CommonArgs) -> Result<TetherConfig> {
    let mut config = match &args.config {
        Some(path) => TetherConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => TetherConfig::from_env()?,
    };

    if let Some(level) = &args.log_level {
        config.monitoring.log_level = level.clone();
    }
    if args.json_logs {
        config.monitoring.json_logs = true;
    }
    config.validate().context("Invalid command-line overrides")?;
    Ok(config)
}

/// Initialize tracing/logging from the monitoring section
pub fn init_logging(config: &TetherConfig) -> Result<()> {
    tether_core::utils::init_logger(&config.monitoring.log_level, config.monitoring.json_logs)?;
    Ok(())
}

/// Shutdown flag flipped by Ctrl+C
///
/// The handler is process-wide; call this once.
pub fn shutdown_signal() -> Result<watch::Receiver<bool>> {
    let (tx, rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        tracing::warn!("Received Ctrl+C, initiating graceful shutdown...");
        tx.send_replace(true);
    })
    .context("Failed to install Ctrl+C handler")?;
    Ok(rx)
}

/// Resolves once `rx` reads true (or its sender is gone)
pub async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    // A dropped sender also counts as shutdown
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Print final statistics
pub fn print_stats(status: &SupervisorStatus) {
    tracing::info!("=== {} ===", status.service);
    tracing::info!("State: {}", status.state);
    tracing::info!("Messages received: {}", status.total_messages);
    tracing::info!("Sequence gaps: {}", status.total_gaps);
    tracing::info!("Connections: {}", status.total_connections);
    tracing::info!(
        "Reconnection attempts: {}",
        status.total_reconnection_attempts
    );

    if status.total_messages > 0 {
        let gap_rate = (status.total_gaps as f64 / status.total_messages as f64) * 100.0;
        tracing::info!("Gap rate: {:.2}%", gap_rate);
    }
}
