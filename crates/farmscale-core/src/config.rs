//! farmscale.toml configuration parser.
//!
//! Scaling options live in a global `[defaults]` table and may be
//! overridden per queue under `[queues.scaling]`. Anything not set falls
//! back to the built-in defaults of [`ScalingSettings`].

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, ConfigResult};
use crate::types::ResourceRange;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmscaleConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub defaults: ScalingOverrides,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
}

/// Loop-wide settings that are not per-queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Samples older than this never drive a scale-up.
    pub staleness_threshold_secs: u64,
    /// Ready workers without a heartbeat for this long are not capacity.
    pub heartbeat_timeout_secs: u64,
    /// Depth samples that must be non-increasing before a scale-down.
    pub trend_window: usize,
    /// How long terminated worker records and settled operations are kept.
    pub retention_secs: u64,
    /// Workers stuck provisioning, or ready but silent, for this long are
    /// terminated and stop counting toward the fleet.
    pub retire_after_secs: u64,
    pub actuation: ActuationConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_secs: 60,
            heartbeat_timeout_secs: 60,
            trend_window: 3,
            retention_secs: 300,
            retire_after_secs: 600,
            actuation: ActuationConfig::default(),
        }
    }
}

/// Retry and acknowledgement settings for actuator calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuationConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// An intent not landed within this window is expired.
    pub ack_timeout_secs: u64,
    pub status_poll_ms: u64,
    /// Upper bound on a single actuator or inventory call.
    pub call_timeout_ms: u64,
}

impl Default for ActuationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            ack_timeout_secs: 120,
            status_poll_ms: 1_000,
            call_timeout_ms: 30_000,
        }
    }
}

impl ActuationConfig {
    /// Worst-case seconds one retried call can take before it gives up.
    pub fn retry_budget_secs(&self) -> u64 {
        let per_attempt = self.call_timeout_ms.saturating_add(self.backoff_max_ms);
        u64::from(self.max_attempts)
            .saturating_mul(per_attempt)
            .div_ceil(1_000)
    }
}

/// Per-queue scaling options. Every field is optional so the same shape
/// serves as `[defaults]` and as a queue override.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalingOverrides {
    pub min_replicas: Option<u32>,
    pub max_replicas: Option<u32>,
    pub target_actions_per_worker: Option<u32>,
    pub scale_up_cooldown_secs: Option<u64>,
    pub scale_down_cooldown_secs: Option<u64>,
    pub drain_grace_secs: Option<u64>,
    pub tick_interval_secs: Option<u64>,
    pub provisioning_weight: Option<f64>,
}

/// Fully resolved scaling options for one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingSettings {
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub target_actions_per_worker: u32,
    pub scale_up_cooldown_secs: u64,
    pub scale_down_cooldown_secs: u64,
    pub drain_grace_secs: u64,
    pub tick_interval_secs: u64,
    pub provisioning_weight: f64,
}

impl Default for ScalingSettings {
    fn default() -> Self {
        Self {
            min_replicas: 1,
            max_replicas: 4,
            target_actions_per_worker: 10,
            scale_up_cooldown_secs: 60,
            scale_down_cooldown_secs: 300,
            drain_grace_secs: 120,
            tick_interval_secs: 15,
            provisioning_weight: 0.5,
        }
    }
}

impl ScalingSettings {
    /// Layer the set fields of `overrides` on top of `self`.
    pub fn with_overrides(&self, overrides: &ScalingOverrides) -> Self {
        Self {
            min_replicas: overrides.min_replicas.unwrap_or(self.min_replicas),
            max_replicas: overrides.max_replicas.unwrap_or(self.max_replicas),
            target_actions_per_worker: overrides
                .target_actions_per_worker
                .unwrap_or(self.target_actions_per_worker),
            scale_up_cooldown_secs: overrides
                .scale_up_cooldown_secs
                .unwrap_or(self.scale_up_cooldown_secs),
            scale_down_cooldown_secs: overrides
                .scale_down_cooldown_secs
                .unwrap_or(self.scale_down_cooldown_secs),
            drain_grace_secs: overrides.drain_grace_secs.unwrap_or(self.drain_grace_secs),
            tick_interval_secs: overrides
                .tick_interval_secs
                .unwrap_or(self.tick_interval_secs),
            provisioning_weight: overrides
                .provisioning_weight
                .unwrap_or(self.provisioning_weight),
        }
    }

    fn validate(&self, queue: &str) -> ConfigResult<()> {
        if self.min_replicas > self.max_replicas {
            return Err(ConfigError::ReplicaBounds {
                queue: queue.to_string(),
                min: self.min_replicas,
                max: self.max_replicas,
            });
        }
        if self.target_actions_per_worker == 0 {
            return Err(ConfigError::ZeroTarget(queue.to_string()));
        }
        if !(0.0..=1.0).contains(&self.provisioning_weight) {
            return Err(ConfigError::ProvisioningWeight {
                queue: queue.to_string(),
                weight: self.provisioning_weight,
            });
        }
        if self.tick_interval_secs == 0 {
            return Err(ConfigError::ZeroTickInterval(queue.to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// Resource ranges a worker must satisfy to serve this queue.
    #[serde(default)]
    pub properties: Vec<ResourceRange>,
    #[serde(default)]
    pub scaling: ScalingOverrides,
}

/// A queue definition with its resolved scaling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub name: String,
    pub properties: Vec<ResourceRange>,
    pub scaling: ScalingSettings,
}

/// Where queue depth comes from and how workers are created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Local farm state in a redb store, fed over the HTTP API.
    Standalone {
        /// Directory for the store file; in-memory when absent.
        data_dir: Option<PathBuf>,
    },
    /// Workers are containers of an on-demand sandbox managed through its CLI.
    Sandbox(SandboxBackendConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Standalone { data_dir: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxBackendConfig {
    /// Full sandbox name; falls back to `SANDBOX_FULL_NAME` when empty.
    pub sandbox_name: String,
    pub cli: String,
    pub server_metrics_url: String,
    pub worker_prefix: String,
    pub worker_metrics_port: u16,
    pub pending_metric: String,
    pub in_progress_metric: String,
    pub slot_usage_metric: String,
    /// Label that scopes server metrics to a queue when present.
    pub queue_label: String,
    pub scrape_timeout_ms: u64,
}

impl Default for SandboxBackendConfig {
    fn default() -> Self {
        Self {
            sandbox_name: String::new(),
            cli: "cs".to_string(),
            server_metrics_url: "http://bf-server:9090/metrics".to_string(),
            worker_prefix: "bf-worker-".to_string(),
            worker_metrics_port: 9090,
            pending_metric: "queue_size".to_string(),
            in_progress_metric: "dispatched_operations_size".to_string(),
            slot_usage_metric: "execution_slot_usage".to_string(),
            queue_label: "queue".to_string(),
            scrape_timeout_ms: 2_000,
        }
    }
}

impl FarmscaleConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a config document.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: FarmscaleConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every queue's resolved settings and the controller settings.
    /// A config that fails here must never drive the control loop.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.queues.is_empty() {
            return Err(ConfigError::NoQueues);
        }

        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.name.trim().is_empty() {
                return Err(ConfigError::EmptyQueueName);
            }
            if !seen.insert(queue.name.as_str()) {
                return Err(ConfigError::DuplicateQueue(queue.name.clone()));
            }
            if let Some(bad) = queue.properties.iter().find(|p| !p.is_valid()) {
                return Err(ConfigError::ResourceRange {
                    queue: queue.name.clone(),
                    property: bad.name.clone(),
                    min: bad.min,
                    max: bad.max,
                });
            }
            self.scaling_for(queue).validate(&queue.name)?;
        }

        let actuation = &self.controller.actuation;
        if self.controller.trend_window == 0 {
            return Err(ConfigError::Controller("trend_window must be positive".into()));
        }
        if actuation.max_attempts == 0 {
            return Err(ConfigError::Controller("max_attempts must be positive".into()));
        }
        if actuation.backoff_base_ms > actuation.backoff_max_ms {
            return Err(ConfigError::Controller(
                "backoff_base_ms exceeds backoff_max_ms".into(),
            ));
        }
        if actuation.ack_timeout_secs == 0 {
            return Err(ConfigError::Controller("ack_timeout_secs must be positive".into()));
        }
        if actuation.call_timeout_ms == 0 {
            return Err(ConfigError::Controller("call_timeout_ms must be positive".into()));
        }
        if self.controller.retire_after_secs < self.controller.heartbeat_timeout_secs {
            return Err(ConfigError::Controller(
                "retire_after_secs is shorter than heartbeat_timeout_secs".into(),
            ));
        }

        if matches!(self.backend, BackendConfig::Sandbox(_)) {
            if self.queues.len() != 1 {
                return Err(ConfigError::SandboxQueues(self.queues.len()));
            }
            // New sandbox workers are copies of an existing one.
            if let Some(queue) = self.queues.iter().find(|q| self.scaling_for(q).min_replicas == 0) {
                return Err(ConfigError::SandboxMinReplicas(queue.name.clone()));
            }
        }
        Ok(())
    }

    /// Resolved settings for every configured queue, in config order.
    pub fn queue_settings(&self) -> Vec<QueueSettings> {
        self.queues
            .iter()
            .map(|q| QueueSettings {
                name: q.name.clone(),
                properties: q.properties.clone(),
                scaling: self.scaling_for(q),
            })
            .collect()
    }

    /// The driver interval: the shortest tick any queue asks for.
    pub fn tick_interval_secs(&self) -> u64 {
        self.queues
            .iter()
            .map(|q| self.scaling_for(q).tick_interval_secs)
            .min()
            .unwrap_or_else(|| ScalingSettings::default().tick_interval_secs)
    }

    fn scaling_for(&self, queue: &QueueConfig) -> ScalingSettings {
        ScalingSettings::default()
            .with_overrides(&self.defaults)
            .with_overrides(&queue.scaling)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Scaffold a single-queue config matching the reference sandbox layout.
    pub fn scaffold(queue: &str) -> Self {
        FarmscaleConfig {
            controller: ControllerConfig::default(),
            defaults: ScalingOverrides {
                min_replicas: Some(1),
                max_replicas: Some(4),
                ..Default::default()
            },
            backend: BackendConfig::default(),
            queues: vec![QueueConfig {
                name: queue.to_string(),
                properties: vec![ResourceRange::new("min-cores", 1, 4)],
                scaling: ScalingOverrides::default(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let toml_str = r#"
[[queues]]
name = "cpu"
"#;
        let config = FarmscaleConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.queues.len(), 1);
        let settings = config.queue_settings();
        assert_eq!(settings[0].scaling, ScalingSettings::default());
        assert!(matches!(
            config.backend,
            BackendConfig::Standalone { data_dir: None }
        ));
    }

    #[test]
    fn queue_override_beats_global_default() {
        let toml_str = r#"
[defaults]
max_replicas = 20
target_actions_per_worker = 5

[[queues]]
name = "cpu"

[[queues]]
name = "gpu"
properties = [{ name = "gpus", min = 1, max = 2 }]

[queues.scaling]
max_replicas = 3
provisioning_weight = 1.0
tick_interval_secs = 30
"#;
        let config = FarmscaleConfig::from_toml_str(toml_str).unwrap();
        let settings = config.queue_settings();

        assert_eq!(settings[0].scaling.max_replicas, 20);
        assert_eq!(settings[0].scaling.target_actions_per_worker, 5);
        assert_eq!(settings[1].scaling.max_replicas, 3);
        assert_eq!(settings[1].scaling.target_actions_per_worker, 5);
        assert_eq!(settings[1].scaling.provisioning_weight, 1.0);
        assert_eq!(settings[1].properties[0].name, "gpus");
        assert_eq!(config.tick_interval_secs(), 15);
    }

    #[test]
    fn min_above_max_is_fatal() {
        let toml_str = r#"
[[queues]]
name = "cpu"
[queues.scaling]
min_replicas = 5
max_replicas = 2
"#;
        let err = FarmscaleConfig::from_toml_str(toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::ReplicaBounds { min: 5, max: 2, .. }));
    }

    #[test]
    fn rejects_bad_settings() {
        let cases = [
            ("[defaults]\ntarget_actions_per_worker = 0\n[[queues]]\nname = \"q\"", "target"),
            ("[defaults]\nprovisioning_weight = 1.5\n[[queues]]\nname = \"q\"", "weight"),
            ("[[queues]]\nname = \"q\"\n[[queues]]\nname = \"q\"", "duplicate"),
            ("[[queues]]\nname = \"\"", "empty"),
            ("[controller]\ntrend_window = 0\n[[queues]]\nname = \"q\"", "trend"),
            (
                "[controller.actuation]\ncall_timeout_ms = 0\n[[queues]]\nname = \"q\"",
                "call timeout",
            ),
            (
                "[controller]\nretire_after_secs = 10\n[[queues]]\nname = \"q\"",
                "retire before heartbeat timeout",
            ),
        ];
        for (doc, label) in cases {
            assert!(FarmscaleConfig::from_toml_str(doc).is_err(), "{label} accepted");
        }
        assert!(matches!(
            FarmscaleConfig::from_toml_str("").unwrap_err(),
            ConfigError::NoQueues
        ));
    }

    #[test]
    fn rejects_inverted_resource_range() {
        let toml_str = r#"
[[queues]]
name = "cpu"
properties = [{ name = "cores", min = 8, max = 2 }]
"#;
        let err = FarmscaleConfig::from_toml_str(toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::ResourceRange { .. }));
    }

    #[test]
    fn sandbox_backend_needs_single_queue() {
        let toml_str = r#"
[backend]
kind = "sandbox"
sandbox_name = "buildfarm/demo"

[[queues]]
name = "a"
[[queues]]
name = "b"
"#;
        let err = FarmscaleConfig::from_toml_str(toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::SandboxQueues(2)));

        let scale_to_zero = r#"
[backend]
kind = "sandbox"
sandbox_name = "buildfarm/demo"

[defaults]
min_replicas = 0

[[queues]]
name = "a"
"#;
        let err = FarmscaleConfig::from_toml_str(scale_to_zero).unwrap_err();
        assert!(matches!(err, ConfigError::SandboxMinReplicas(ref q) if q == "a"));

        let single = r#"
[backend]
kind = "sandbox"
sandbox_name = "buildfarm/demo"

[[queues]]
name = "a"
"#;
        let config = FarmscaleConfig::from_toml_str(single).unwrap();
        match config.backend {
            BackendConfig::Sandbox(sandbox) => {
                assert_eq!(sandbox.sandbox_name, "buildfarm/demo");
                assert_eq!(sandbox.worker_prefix, "bf-worker-");
                assert_eq!(sandbox.pending_metric, "queue_size");
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn retry_budget_covers_every_attempt() {
        let actuation = ActuationConfig {
            max_attempts: 3,
            backoff_max_ms: 500,
            call_timeout_ms: 1_200,
            ..Default::default()
        };
        assert_eq!(actuation.retry_budget_secs(), 6);
        assert_eq!(ActuationConfig::default().retry_budget_secs(), 152);
    }

    #[test]
    fn load_reads_file_and_scaffold_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("farmscale.toml");
        let scaffold = FarmscaleConfig::scaffold("default");
        std::fs::write(&path, scaffold.to_toml_string().unwrap()).unwrap();

        let loaded = FarmscaleConfig::load(&path).unwrap();
        assert_eq!(loaded.queue_settings(), scaffold.queue_settings());

        let missing = FarmscaleConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
