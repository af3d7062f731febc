pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock, epoch_secs};
pub use config::{
    ActuationConfig, BackendConfig, ControllerConfig, FarmscaleConfig, QueueConfig, QueueSettings,
    SandboxBackendConfig, ScalingOverrides, ScalingSettings,
};
pub use error::{ConfigError, ConfigResult};
pub use types::*;
