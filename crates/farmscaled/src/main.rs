//! farmscaled: the farmscale daemon.
//!
//! Assembles the controller:
//! - Configuration (TOML)
//! - Backplane probe and fleet backend (standalone store or sandbox CLI)
//! - Reconciler loop
//! - HTTP API (health, readiness, queue state, events, metrics)
//!
//! # Usage
//!
//! ```text
//! farmscaled run --config /etc/farmscale.toml --port 9464
//! farmscaled check-config --config /etc/farmscale.toml
//! farmscaled init --queue default > farmscale.toml
//! ```

mod backend;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use farmscale_core::{Clock, FarmscaleConfig, SystemClock};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,farmscaled=debug,farmscale=debug";

#[derive(Parser)]
#[command(name = "farmscaled", about = "Buildfarm autoscaling controller")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller and its HTTP API.
    Run {
        /// Path to the configuration file.
        #[arg(long, env = "FARMSCALE_CONFIG", default_value = "farmscale.toml")]
        config: PathBuf,

        /// Port for the HTTP API.
        #[arg(long, default_value = "9464")]
        port: u16,

        #[arg(long, value_enum, default_value = "text")]
        log_format: LogFormat,
    },
    /// Parse and validate a configuration file, then exit.
    CheckConfig {
        #[arg(long, env = "FARMSCALE_CONFIG", default_value = "farmscale.toml")]
        config: PathBuf,
    },
    /// Print a single-queue configuration to start from.
    Init {
        #[arg(long, default_value = "default")]
        queue: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            log_format,
        } => {
            init_tracing(log_format);
            run(config, port).await
        }
        Command::CheckConfig { config } => {
            let loaded = FarmscaleConfig::load(&config)
                .with_context(|| format!("invalid config {}", config.display()))?;
            for queue in loaded.queue_settings() {
                println!(
                    "{}: replicas {}..={}, {} actions/worker, tick {}s",
                    queue.name,
                    queue.scaling.min_replicas,
                    queue.scaling.max_replicas,
                    queue.scaling.target_actions_per_worker,
                    queue.scaling.tick_interval_secs,
                );
            }
            println!("{} ok", config.display());
            Ok(())
        }
        Command::Init { queue } => {
            print!("{}", FarmscaleConfig::scaffold(&queue).to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

async fn run(config_path: PathBuf, port: u16) -> anyhow::Result<()> {
    let config = FarmscaleConfig::load(&config_path)
        .with_context(|| format!("invalid config {}", config_path.display()))?;
    info!(
        path = %config_path.display(),
        queues = config.queues.len(),
        "farmscale daemon starting"
    );

    // ── Backend and control loop ───────────────────────────────

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let farm = backend::build(&config, clock)?;
    let reconciler = farm.reconciler.clone();
    info!(
        interval_secs = reconciler.tick_interval().as_secs(),
        "reconciler initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconcile_handle = tokio::spawn(async move {
        reconciler.run(shutdown_rx).await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = farmscale_api::build_router(farmscale_api::ApiState {
        reconciler: farm.reconciler.clone(),
        farm: farm.store.clone(),
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for the loop to abort in-flight actuations.
    let _ = reconcile_handle.await;

    info!("farmscale daemon stopped");
    Ok(())
}
