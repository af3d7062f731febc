//! Backend wiring: picks the probe and fleet implementations named by the
//! config and hands them to a reconciler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use farmscale_autoscale::Reconciler;
use farmscale_backplane::{BackplaneProbe, MetricsBackplane, StoreBackplane};
use farmscale_core::{BackendConfig, Clock, FarmscaleConfig, SandboxBackendConfig};
use farmscale_fleet::{CsCli, LocalFleet, SandboxFleet, tcp_reachability};
use farmscale_state::FarmStore;
use tracing::info;

const SANDBOX_NAME_ENV: &str = "SANDBOX_FULL_NAME";

/// A wired controller. `store` is present only for the standalone backend,
/// where depth reports and heartbeats arrive over the API.
pub struct Farm {
    pub reconciler: Reconciler,
    pub store: Option<FarmStore>,
}

pub fn build(config: &FarmscaleConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Farm> {
    match &config.backend {
        BackendConfig::Standalone { data_dir } => {
            let store = match data_dir {
                Some(dir) => {
                    std::fs::create_dir_all(dir)
                        .with_context(|| format!("failed to create {}", dir.display()))?;
                    let path = dir.join("farmscale.redb");
                    info!(path = %path.display(), "opening farm store");
                    FarmStore::open(&path)?
                }
                None => {
                    info!("no data_dir configured, farm state is in-memory");
                    FarmStore::open_in_memory()?
                }
            };
            standalone(config, store, clock)
        }
        BackendConfig::Sandbox(sandbox) => sandboxed(config, sandbox, clock),
    }
}

/// Standalone wiring over an existing store. Registers every configured queue.
pub fn standalone(
    config: &FarmscaleConfig,
    store: FarmStore,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Farm> {
    let now = clock.now();
    for queue in config.queue_settings() {
        store.ensure_queue(&queue.name, &queue.properties, now)?;
    }

    let fleet = Arc::new(LocalFleet::new(store.clone(), clock.clone()));
    let probe: Arc<dyn BackplaneProbe> = Arc::new(StoreBackplane::new(store.clone()));
    let reconciler = Reconciler::new(config, probe, fleet.clone(), fleet, clock);
    info!(queues = config.queues.len(), "standalone backend wired");

    Ok(Farm {
        reconciler,
        store: Some(store),
    })
}

fn sandboxed(
    config: &FarmscaleConfig,
    sandbox: &SandboxBackendConfig,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Farm> {
    let queues = config.queue_settings();
    let [queue] = queues.as_slice() else {
        bail!(
            "the sandbox backend drives exactly one queue, {} configured",
            queues.len()
        );
    };

    let name = if sandbox.sandbox_name.is_empty() {
        std::env::var(SANDBOX_NAME_ENV).with_context(|| {
            format!("backend.sandbox_name is empty and {SANDBOX_NAME_ENV} is not set")
        })?
    } else {
        sandbox.sandbox_name.clone()
    };

    let cli = Arc::new(CsCli::new(
        &sandbox.cli,
        &name,
        Duration::from_millis(config.controller.actuation.call_timeout_ms),
    ));
    let reachable = tcp_reachability(
        sandbox.worker_metrics_port,
        Duration::from_millis(sandbox.scrape_timeout_ms),
    );
    let fleet = Arc::new(SandboxFleet::new(
        cli,
        &queue.name,
        &sandbox.worker_prefix,
        queue.scaling.max_replicas,
        reachable,
        clock.clone(),
    ));
    let probe: Arc<dyn BackplaneProbe> = Arc::new(MetricsBackplane::new(sandbox, &queues));
    let reconciler = Reconciler::new(config, probe, fleet.clone(), fleet, clock);
    info!(sandbox = %name, queue = %queue.name, "sandbox backend wired");

    Ok(Farm {
        reconciler,
        store: None,
    })
}
