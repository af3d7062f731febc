//! Backplane read errors. All of them are transient from the
//! controller's point of view.

use thiserror::Error;

pub type ProbeResult<T> = Result<T, ProbeError>;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("backplane unreachable: {0}")]
    Unreachable(String),

    #[error("backplane returned HTTP {0}")]
    Status(u16),

    #[error("backplane read timed out")]
    Timeout,

    #[error("malformed backplane response: {0}")]
    Malformed(String),

    #[error("store error: {0}")]
    State(#[from] farmscale_state::StateError),
}
