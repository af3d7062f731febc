//! Configuration errors. All of them are fatal at startup.

use std::path::PathBuf;

use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no queues configured")]
    NoQueues,

    #[error("queue name must not be empty")]
    EmptyQueueName,

    #[error("duplicate queue: {0}")]
    DuplicateQueue(String),

    #[error("queue {queue}: min_replicas {min} exceeds max_replicas {max}")]
    ReplicaBounds { queue: String, min: u32, max: u32 },

    #[error("queue {0}: target_actions_per_worker must be positive")]
    ZeroTarget(String),

    #[error("queue {queue}: provisioning_weight {weight} is outside [0, 1]")]
    ProvisioningWeight { queue: String, weight: f64 },

    #[error("queue {0}: tick_interval_secs must be positive")]
    ZeroTickInterval(String),

    #[error("queue {queue}: property {property} has min {min} greater than max {max}")]
    ResourceRange {
        queue: String,
        property: String,
        min: u64,
        max: u64,
    },

    #[error("invalid controller setting: {0}")]
    Controller(String),

    #[error("sandbox backend manages exactly one queue, found {0}")]
    SandboxQueues(usize),

    #[error("queue {0}: sandbox backend needs min_replicas of at least 1")]
    SandboxMinReplicas(String),
}
