//! Berth Runner
//!
//! Runs build steps inside containers of a local container runtime.
//!
//! Architecture:
//! - Configuration: Load settings from environment, flags or defaults
//! - Driver: Container runtime commands (docker/podman CLI)
//! - Services: Capacity admission, image resolution, container provisioning
//! - Repository: Context snapshots of each job's last build
//! - Scheduler: Build harness running builds concurrently against one gate
//!
//! Each build gets a long-lived remoting container owning the workspace
//! volumes, one build container per command and optional side containers,
//! all sharing the remoting container's volumes and network.

mod config;
mod driver;
mod repository;
mod scheduler;
mod service;
mod transport;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::driver::{CliRuntimeDriver, RuntimeDriver};
use crate::repository::FileContextStore;
use crate::scheduler::{BuildDescription, BuildRunner};
use crate::service::CapacityGate;

/// Command line options; each one overrides its BERTH_* variable
#[derive(Parser, Debug)]
#[command(name = "berth-runner", version, about = "Run build steps in containers")]
struct Args {
    /// JSON build descriptions, or directories of them; builds run concurrently
    #[arg(env = "BERTH_BUILD", value_delimiter = ',', required = true, num_args = 1..)]
    builds: Vec<PathBuf>,

    /// Container runtime binary
    #[arg(long)]
    runtime: Option<String>,

    /// Container runtime endpoint
    #[arg(long)]
    runtime_host: Option<String>,

    /// Directory holding build context snapshots
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Maximum number of running builds for the default constraint
    #[arg(long)]
    container_cap: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "berth_runner=info".into()),
        )
        // stdout carries the builds' output
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    info!("Starting Berth Runner");

    let config = load_config(&args)?;
    info!(
        "Loaded configuration: runtime={}, container_cap={}, constraint_cap={}, state_dir={}",
        config.runtime,
        config.container_cap,
        config.constraint_cap,
        config.state_dir.display()
    );

    let driver = CliRuntimeDriver::new(config.driver_settings());
    let version = driver
        .check_available()
        .await
        .context("Container runtime is not available")?;
    info!("Using {}", version.trim());
    let driver: Arc<dyn RuntimeDriver> = Arc::new(driver);

    let gate = Arc::new(
        CapacityGate::new(config.container_cap, config.default_constraint.clone())
            .with_constraint_cap(config.constraint_cap)
            .with_backoff(config.admission_base_delay, config.admission_max_delay),
    );
    let store = Arc::new(FileContextStore::new(config.state_dir.clone()));
    let runner = Arc::new(BuildRunner::new(driver, gate, store, config.images()));

    let descriptions = BuildDescription::load_all(&args.builds).await?;
    info!("Loaded {} build description(s)", descriptions.len());

    // Ctrl-C ends pending admission waits
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, aborting builds");
            on_interrupt.cancel();
        }
    });

    let results = runner
        .run_all(descriptions, tokio::io::stdout, &cancel)
        .await;

    let mut failed = 0;
    for (job, result) in results {
        match result {
            Ok(Some(outcome)) if !outcome.success() => {
                error!("Build {} of {} failed", outcome.build_id, job);
                failed += 1;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Build of {} failed: {:#}", job, e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} build(s) failed", failed);
    }

    Ok(())
}

/// Loads configuration from environment variables, then applies flags
fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::from_env()?;

    if let Some(runtime) = &args.runtime {
        config.runtime = runtime.clone();
    }
    if let Some(host) = &args.runtime_host {
        config.runtime_host = Some(host.clone());
    }
    if let Some(dir) = &args.state_dir {
        config.state_dir = dir.clone();
    }
    if let Some(cap) = args.container_cap {
        config.container_cap = cap;
    }

    config.validate()?;
    Ok(config)
}
