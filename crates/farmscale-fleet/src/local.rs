//! Fleet backed by the local farm store.
//!
//! Provisioning inserts workers in the Provisioning state and is
//! acknowledged immediately; a worker becomes Ready on its first
//! heartbeat. Termination marks the record Terminated.

use std::sync::Arc;

use farmscale_core::{BoxFuture, Clock};
use farmscale_state::{
    FarmStore, OperationId, OperationKind, OperationRecord, OperationStatus, WorkerInstance,
    WorkerState,
};
use tracing::{debug, info};

use crate::actuator::FleetActuator;
use crate::error::{FleetError, FleetResult};
use crate::inventory::FleetInventory;

#[derive(Clone)]
pub struct LocalFleet {
    store: FarmStore,
    clock: Arc<dyn Clock>,
}

impl LocalFleet {
    pub fn new(store: FarmStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &FarmStore {
        &self.store
    }

    fn provision_now(&self, queue: &str, count: u32) -> FleetResult<OperationId> {
        if self.store.get_queue(queue)?.is_none() {
            return Err(FleetError::UnknownQueue(queue.to_string()));
        }
        let now = self.clock.now();
        let workers = self.store.insert_workers(queue, count, now)?;
        let op = OperationRecord {
            id: format!("provision-{}", self.store.next_sequence("operation")?),
            kind: OperationKind::Provision {
                queue: queue.to_string(),
                count,
            },
            status: OperationStatus::Acknowledged,
            instances: workers.iter().map(|w| w.id.clone()).collect(),
            created_at: now,
        };
        self.store.put_operation(&op)?;
        info!(%queue, count, operation = %op.id, "workers provisioned");
        Ok(op.id)
    }

    fn terminate_now(&self, instance: &str) -> FleetResult<OperationId> {
        // One operation per instance: a repeated terminate returns the
        // same id and leaves the record alone.
        let op_id = format!("terminate-{instance}");
        if let Some(existing) = self.store.get_operation(&op_id)? {
            debug!(%instance, "terminate repeated");
            return Ok(existing.id);
        }

        let now = self.clock.now();
        match self.store.get_worker(instance)? {
            Some(worker) if worker.state != WorkerState::Terminated => {
                self.store
                    .transition_worker(instance, WorkerState::Terminated, now)?;
                self.store.set_worker_load(instance, 0)?;
                info!(%instance, queue = %worker.queue, "worker terminated");
            }
            _ => debug!(%instance, "terminate on absent or terminated worker"),
        }

        let op = OperationRecord {
            id: op_id,
            kind: OperationKind::Terminate {
                instance: instance.to_string(),
            },
            status: OperationStatus::Acknowledged,
            instances: vec![instance.to_string()],
            created_at: now,
        };
        self.store.put_operation(&op)?;
        Ok(op.id)
    }

    fn drain_now(&self, instance: &str) -> FleetResult<()> {
        match self.store.get_worker(instance)? {
            Some(worker) if worker.state < WorkerState::Draining => {
                self.store
                    .transition_worker(instance, WorkerState::Draining, self.clock.now())?;
                debug!(%instance, "worker draining");
            }
            _ => {}
        }
        Ok(())
    }
}

impl FleetInventory for LocalFleet {
    fn list<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, FleetResult<Vec<WorkerInstance>>> {
        Box::pin(async move { Ok(self.store.list_workers_for_queue(queue)?) })
    }

    fn observe<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, FleetResult<Option<WorkerState>>> {
        Box::pin(async move { Ok(self.store.get_worker(instance)?.map(|w| w.state)) })
    }

    fn prune_terminated(&self, retention_secs: u64) -> BoxFuture<'_, FleetResult<u32>> {
        Box::pin(async move {
            let now = self.clock.now();
            let workers = self.store.prune_terminated(retention_secs, now)?;
            let operations = self.store.prune_operations(retention_secs, now)?;
            Ok(workers + operations)
        })
    }
}

impl FleetActuator for LocalFleet {
    fn provision<'a>(&'a self, queue: &'a str, count: u32) -> BoxFuture<'a, FleetResult<OperationId>> {
        Box::pin(async move { self.provision_now(queue, count) })
    }

    fn terminate<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, FleetResult<OperationId>> {
        Box::pin(async move { self.terminate_now(instance) })
    }

    fn status<'a>(&'a self, operation: &'a str) -> BoxFuture<'a, FleetResult<OperationStatus>> {
        Box::pin(async move {
            self.store
                .get_operation(operation)?
                .map(|op| op.status)
                .ok_or_else(|| FleetError::UnknownOperation(operation.to_string()))
        })
    }

    fn begin_drain<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, FleetResult<()>> {
        Box::pin(async move { self.drain_now(instance) })
    }
}
