use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prometheus::Registry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use synban::config::Config;
use synban::firewall::{Firewall, IptablesBackend, IptablesFirewall};
use synban::tracker::{Tracker, TrackerParams};

/// How long a drain may take after a shutdown signal before the process
/// force-exits.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(20);

#[derive(Parser)]
#[command(name = "synban")]
#[command(author, version, about = "TCP port-scan detection and blocking agent")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Network interface to capture on (overrides the config file)
    #[arg(short, long, global = true)]
    pub interface: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the detection pipeline (default)
    Run,

    /// Remove the firewall chain left behind by a previous run
    Teardown,
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    if let Some(interface) = cli.interface {
        config.capture.interface = interface;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_pipeline(config).await,
        Commands::Teardown => teardown(&config),
    }
}

async fn run_pipeline(config: Config) -> Result<()> {
    let firewall = Arc::new(
        IptablesFirewall::new(&config.capture.interface, &config.firewall)
            .context("firewall initialization failed")?,
    );

    // Handed to the metrics HTTP surface when one is mounted in front of
    // this process; the pipeline itself only increments counters.
    let metrics = Registry::new();

    let tracker = Tracker::new(
        TrackerParams {
            interface: config.capture.interface.clone(),
            detection: config.detection.clone(),
            firewall,
        },
        &metrics,
    )?;
    let shutdown = tracker.shutdown_handle();
    let mut pipeline = tokio::spawn(tracker.run());

    tokio::select! {
        result = &mut pipeline => result.context("pipeline task panicked")??,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, draining pipeline");
            shutdown.request();
            match tokio::time::timeout(SHUTDOWN_GRACE, pipeline).await {
                Ok(result) => result.context("pipeline task panicked")??,
                Err(_) => {
                    error!("graceful shutdown timed out, forcing exit");
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

fn teardown(config: &Config) -> Result<()> {
    let backend = Box::new(IptablesBackend::new().context("failed to open iptables handle")?);
    let firewall = IptablesFirewall::with_backend(backend, &config.firewall.chain, Vec::new());
    firewall.close()?;
    info!(chain = %config.firewall.chain, "firewall chain removed");
    Ok(())
}
