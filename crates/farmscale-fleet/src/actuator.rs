//! Actuator contract.

use farmscale_core::BoxFuture;
use farmscale_state::{OperationId, OperationStatus};

use crate::error::FleetResult;

/// Write side of the fleet. Every call is asynchronous relative to the
/// inventory: a successful call means the request was accepted, not that
/// the fleet already changed.
pub trait FleetActuator: Send + Sync {
    /// Request `count` new workers for `queue`.
    fn provision<'a>(&'a self, queue: &'a str, count: u32) -> BoxFuture<'a, FleetResult<OperationId>>;

    /// Request removal of one worker. Succeeds without side effects when
    /// the worker is already terminated or unknown.
    fn terminate<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, FleetResult<OperationId>>;

    /// Status of an operation returned by `provision` or `terminate`.
    fn status<'a>(&'a self, operation: &'a str) -> BoxFuture<'a, FleetResult<OperationStatus>>;

    /// Mark a worker Draining so it stops counting as capacity before
    /// it is terminated.
    fn begin_drain<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, FleetResult<()>>;
}
