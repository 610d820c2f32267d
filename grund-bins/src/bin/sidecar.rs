//! Grund sidecar - the shared runtime as a standalone process
//!
//! Brings up the full infrastructure stack (connection probing, health
//! endpoints, metrics export, alert evaluation) without any service
//! logic on top. Used as a deployment canary and as a harness for
//! exercising a configuration against real backends.

use anyhow::{Context, Result};
use clap::Parser;
use grund_core::utils::init_logging;
use grund_core::{Config, ServiceRuntime};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Service name used for config lookup, metrics, and alerts
    #[arg(short, long, default_value = "grund-sidecar")]
    service: String,

    /// Directory holding the layered YAML configuration
    #[arg(long, default_value = "config")]
    config_dir: String,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs);

    info!(service = %args.service, "=== Grund sidecar ===");

    let config = Config::load(&args.service, &args.config_dir)
        .with_context(|| format!("loading configuration from {}/", args.config_dir))?;
    let runtime = ServiceRuntime::new(config).context("building service runtime")?;

    if let Err(err) = runtime.start().await {
        error!(error = %err, "startup failed");
        runtime.shutdown().await;
        anyhow::bail!("startup failed: {}", err);
    }

    let (stop_tx, mut stop_rx) = tokio::sync::mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        warn!("received termination signal, initiating graceful shutdown");
        let _ = stop_tx.send(());
    })
    .context("installing signal handler")?;

    stop_rx.recv().await;
    runtime.shutdown().await;
    info!("sidecar stopped");
    Ok(())
}
