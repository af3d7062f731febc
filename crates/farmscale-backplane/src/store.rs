//! Probe backed by the local farm store.

use farmscale_core::BoxFuture;
use farmscale_state::FarmStore;

use crate::error::{ProbeError, ProbeResult};
use crate::probe::{BackplaneProbe, QueueReading};

/// Reads queue counters and worker leases straight from a [`FarmStore`].
#[derive(Clone)]
pub struct StoreBackplane {
    store: FarmStore,
}

impl StoreBackplane {
    pub fn new(store: FarmStore) -> Self {
        Self { store }
    }
}

impl BackplaneProbe for StoreBackplane {
    fn read<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, ProbeResult<QueueReading>> {
        Box::pin(async move {
            let record = self
                .store
                .get_queue(queue)?
                .ok_or_else(|| ProbeError::UnknownQueue(queue.to_string()))?;
            Ok(QueueReading {
                depth: record.depth,
                properties: record.properties,
            })
        })
    }

    fn instance_in_progress<'a>(
        &'a self,
        _queue: &'a str,
        instance: &'a str,
    ) -> BoxFuture<'a, ProbeResult<Option<u64>>> {
        Box::pin(async move { Ok(self.store.worker_load(instance)?) })
    }
}
