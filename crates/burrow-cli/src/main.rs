//! burrow command line
//!
//! `burrow run` loads the configuration file, starts every enabled tunnel,
//! and keeps them up until interrupted. `check` validates a configuration
//! without connecting anywhere; `test` probes one tunnel's SSH endpoint on
//! a throwaway session.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use burrow_core::config::{self, BurrowFile, TunnelKind};
use burrow_tunnel::{RusshConnector, TunnelRegistry};

#[derive(Parser)]
#[command(name = "burrow")]
#[command(about = "SSH reverse-tunnel orchestrator")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start every enabled tunnel and run until interrupted
    Run,

    /// Validate the configuration without connecting anywhere
    Check,

    /// Probe one tunnel's SSH connectivity on a throwaway session
    Test {
        /// Tunnel id or name
        tunnel: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = cli
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);

    match cli.command {
        Command::Run => run(&path).await,
        Command::Check => check(&path),
        Command::Test { tunnel, json } => test(&path, &tunnel, json).await,
    }
}

fn load(path: &Path) -> Result<BurrowFile> {
    let file: BurrowFile = config::load_config(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    file.validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(file)
}

async fn run(path: &Path) -> Result<()> {
    let file = load(path)?;
    if file.tunnels.is_empty() && file.sets.is_empty() {
        bail!("{} declares no tunnels", path.display());
    }

    let registry = TunnelRegistry::new(Arc::new(RusshConnector::new()));
    for kind in file.kinds() {
        registry.create(kind)?;
    }
    tracing::info!(tunnels = registry.len(), "configuration loaded");
    registry.start_enabled().await;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested, draining tunnels");
    registry.stop_all().await;
    Ok(())
}

fn check(path: &Path) -> Result<()> {
    let file = load(path)?;
    for kind in file.kinds() {
        let mode = match &kind {
            TunnelKind::Single(_) => "single",
            TunnelKind::Full(_) => "full",
        };
        let state = if kind.enabled() { "enabled" } else { "disabled" };
        println!("{}  {}  [{}] {}", kind.id(), kind.name(), mode, state);
    }
    println!(
        "ok: {} tunnel(s), {} set(s)",
        file.tunnels.len(),
        file.sets.len()
    );
    Ok(())
}

async fn test(path: &Path, needle: &str, json: bool) -> Result<()> {
    let file = load(path)?;
    let kind = file
        .kinds()
        .into_iter()
        .find(|k| k.id().as_str() == needle || k.name() == needle)
        .with_context(|| format!("no tunnel named or identified by '{}'", needle))?;

    let registry = TunnelRegistry::new(Arc::new(RusshConnector::new()));
    let id = registry.create(kind)?;
    let report = registry.test(&id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.success {
        println!("ok: {} ({} ms)", needle, report.latency.as_millis());
    } else {
        println!(
            "failed: {} ({} ms): {}",
            needle,
            report.latency.as_millis(),
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    if !report.success {
        std::process::exit(1);
    }
    Ok(())
}
