//! Fleet errors.

use thiserror::Error;

pub type FleetResult<T> = Result<T, FleetError>;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("no capacity left for queue {0}")]
    CapacityExhausted(String),

    #[error("sandbox CLI exited {code}: {stderr}")]
    Cli { code: i32, stderr: String },

    #[error("failed to run sandbox CLI: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("invalid sandbox definition: {0}")]
    Definition(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("store error: {0}")]
    State(#[from] farmscale_state::StateError),
}
