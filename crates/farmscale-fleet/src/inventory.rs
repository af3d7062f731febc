//! Inventory contract.

use farmscale_core::BoxFuture;
use farmscale_state::{WorkerInstance, WorkerState};

use crate::error::FleetResult;

/// Read side of the fleet.
pub trait FleetInventory: Send + Sync {
    /// Workers assigned to `queue`, oldest first.
    fn list<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, FleetResult<Vec<WorkerInstance>>>;

    /// Current state of one worker, `None` if the inventory has no record.
    fn observe<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, FleetResult<Option<WorkerState>>>;

    /// Forget terminated workers and settled operations older than the
    /// retention window. Returns how many records were dropped.
    fn prune_terminated(&self, retention_secs: u64) -> BoxFuture<'_, FleetResult<u32>>;
}
