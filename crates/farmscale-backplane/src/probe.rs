//! The probe contract consumed by the reconciler.

use farmscale_core::{BoxFuture, ResourceRange};
use farmscale_state::QueueDepth;
use serde::Serialize;

use crate::error::ProbeResult;

/// One raw read from the backplane.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueReading {
    pub depth: QueueDepth,
    pub properties: Vec<ResourceRange>,
}

/// A reading annotated with when it was taken and whether it can be
/// trusted for scale-up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSample {
    pub queue: String,
    pub depth: QueueDepth,
    pub properties: Vec<ResourceRange>,
    pub sampled_at: u64,
    /// The read failed and this is the last good sample.
    pub from_cache: bool,
    /// Too old to drive a scale-up.
    pub stale: bool,
}

/// Source of queue depth and per-worker load.
pub trait BackplaneProbe: Send + Sync {
    /// Read the current counters and properties of a queue.
    fn read<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, ProbeResult<QueueReading>>;

    /// In-progress actions held by one worker, or `None` when the backend
    /// cannot scope counts to an instance.
    fn instance_in_progress<'a>(
        &'a self,
        queue: &'a str,
        instance: &'a str,
    ) -> BoxFuture<'a, ProbeResult<Option<u64>>>;
}
