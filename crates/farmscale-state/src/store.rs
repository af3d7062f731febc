//! FarmStore — redb-backed source of truth for a local farm.
//!
//! Provides typed operations over queues, workers, per-worker leases and
//! actuator operations. Read-modify-write operations (worker transitions,
//! heartbeats, sequence allocation) run inside a single write transaction.
//! The store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use farmscale_core::ResourceRange;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe farm store backed by redb.
#[derive(Clone)]
pub struct FarmStore {
    db: Arc<Database>,
}

impl FarmStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "farm store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory farm store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(QUEUES).map_err(map_err!(Table))?;
        txn.open_table(WORKERS).map_err(map_err!(Table))?;
        txn.open_table(LEASES).map_err(map_err!(Table))?;
        txn.open_table(OPERATIONS).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Queues ─────────────────────────────────────────────────────

    /// Register a queue definition. Observed counters of an existing
    /// record are kept; only the properties are refreshed.
    pub fn ensure_queue(
        &self,
        name: &str,
        properties: &[ResourceRange],
        now: u64,
    ) -> StateResult<QueueRecord> {
        let record = match self.get_queue(name)? {
            Some(mut existing) => {
                existing.properties = properties.to_vec();
                existing
            }
            None => QueueRecord {
                name: name.to_string(),
                properties: properties.to_vec(),
                depth: QueueDepth::default(),
                updated_at: now,
            },
        };
        self.put_json(QUEUES, name, &record)?;
        debug!(queue = %name, "queue registered");
        Ok(record)
    }

    pub fn get_queue(&self, name: &str) -> StateResult<Option<QueueRecord>> {
        self.get_json(QUEUES, name)
    }

    pub fn list_queues(&self) -> StateResult<Vec<QueueRecord>> {
        self.scan_json(QUEUES)
    }

    /// Record the backplane's latest counters for a queue.
    pub fn set_queue_depth(&self, name: &str, depth: QueueDepth, now: u64) -> StateResult<()> {
        let mut record = self
            .get_queue(name)?
            .ok_or_else(|| StateError::NotFound(format!("queue {name}")))?;
        record.depth = depth;
        record.updated_at = now;
        self.put_json(QUEUES, name, &record)
    }

    // ── Workers ────────────────────────────────────────────────────

    /// Insert or replace a worker record.
    pub fn put_worker(&self, worker: &WorkerInstance) -> StateResult<()> {
        self.put_json(WORKERS, &worker.id, worker)
    }

    pub fn get_worker(&self, id: &str) -> StateResult<Option<WorkerInstance>> {
        self.get_json(WORKERS, id)
    }

    /// Workers of one queue, oldest first.
    pub fn list_workers_for_queue(&self, queue: &str) -> StateResult<Vec<WorkerInstance>> {
        let mut workers: Vec<WorkerInstance> = self
            .scan_json::<WorkerInstance>(WORKERS)?
            .into_iter()
            .filter(|w| w.queue == queue)
            .collect();
        workers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(workers)
    }

    /// Allocate `count` new Provisioning workers for a queue in one
    /// transaction. Ids are `{queue}-worker-{n}` with `n` never reused.
    pub fn insert_workers(
        &self,
        queue: &str,
        count: u32,
        now: u64,
    ) -> StateResult<Vec<WorkerInstance>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut created = Vec::with_capacity(count as usize);
        {
            let mut seq = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            let mut workers = txn.open_table(WORKERS).map_err(map_err!(Table))?;
            let key = format!("worker:{queue}");
            let mut next = seq
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0);

            for _ in 0..count {
                next += 1;
                let worker = WorkerInstance::new(&format!("{queue}-worker-{next}"), queue, now);
                let value = serde_json::to_vec(&worker).map_err(map_err!(Serialize))?;
                workers
                    .insert(worker.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                created.push(worker);
            }
            seq.insert(key.as_str(), next).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%queue, count, "workers inserted");
        Ok(created)
    }

    /// Move a worker forward in its lifecycle. Moving to the state it is
    /// already in is a no-op; moving backward is rejected.
    pub fn transition_worker(
        &self,
        id: &str,
        next: WorkerState,
        now: u64,
    ) -> StateResult<WorkerInstance> {
        self.update_worker(id, |worker| {
            if !worker.state.can_transition_to(next) {
                return Err(StateError::InvalidTransition {
                    id: worker.id.clone(),
                    from: worker.state,
                    to: next,
                });
            }
            if worker.state != next {
                worker.state = next;
                match next {
                    WorkerState::Draining => worker.drain_started_at = Some(now),
                    WorkerState::Terminated => worker.terminated_at = Some(now),
                    _ => {}
                }
            }
            Ok(())
        })
    }

    /// Record a heartbeat. The first heartbeat of a Provisioning worker
    /// makes it Ready; heartbeats from terminated workers are ignored.
    pub fn record_heartbeat(&self, id: &str, now: u64) -> StateResult<WorkerInstance> {
        self.update_worker(id, |worker| {
            if worker.state == WorkerState::Terminated {
                return Ok(());
            }
            worker.last_heartbeat = Some(now);
            if worker.state == WorkerState::Provisioning {
                worker.state = WorkerState::Ready;
            }
            Ok(())
        })
    }

    /// Delete terminated workers whose retention window has passed.
    /// Returns the number of records removed.
    pub fn prune_terminated(&self, retention_secs: u64, now: u64) -> StateResult<u32> {
        let expired: Vec<String> = self
            .scan_json::<WorkerInstance>(WORKERS)?
            .into_iter()
            .filter(|w| {
                w.state == WorkerState::Terminated
                    && w
                        .terminated_at
                        .is_some_and(|t| now.saturating_sub(t) > retention_secs)
            })
            .map(|w| w.id)
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut workers = txn.open_table(WORKERS).map_err(map_err!(Table))?;
            let mut leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
            for id in &expired {
                workers.remove(id.as_str()).map_err(map_err!(Write))?;
                leases.remove(id.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = expired.len(), "terminated workers pruned");
        Ok(expired.len() as u32)
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Set the number of actions a worker currently holds.
    pub fn set_worker_load(&self, id: &str, in_progress: u64) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            table.insert(id, in_progress).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// In-progress actions reported for a worker, if any were reported.
    pub fn worker_load(&self, id: &str) -> StateResult<Option<u64>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LEASES).map_err(map_err!(Table))?;
        let load = table.get(id).map_err(map_err!(Read))?.map(|g| g.value());
        Ok(load)
    }

    // ── Operations ─────────────────────────────────────────────────

    pub fn put_operation(&self, op: &OperationRecord) -> StateResult<()> {
        self.put_json(OPERATIONS, &op.id, op)
    }

    pub fn get_operation(&self, id: &str) -> StateResult<Option<OperationRecord>> {
        self.get_json(OPERATIONS, id)
    }

    /// Delete settled operations older than the retention window. Pending
    /// operations are kept however old they are. Returns the number removed.
    pub fn prune_operations(&self, retention_secs: u64, now: u64) -> StateResult<u32> {
        let expired: Vec<String> = self
            .scan_json::<OperationRecord>(OPERATIONS)?
            .into_iter()
            .filter(|op| {
                op.status != OperationStatus::Pending
                    && now.saturating_sub(op.created_at) > retention_secs
            })
            .map(|op| op.id)
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(OPERATIONS).map_err(map_err!(Table))?;
            for id in &expired {
                table.remove(id.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = expired.len(), "settled operations pruned");
        Ok(expired.len() as u32)
    }

    /// Allocate the next value of a named counter.
    pub fn next_sequence(&self, name: &str) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next;
        {
            let mut table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            let current = table
                .get(name)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0);
            next = current + 1;
            table.insert(name, next).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(next)
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn update_worker<F>(&self, id: &str, apply: F) -> StateResult<WorkerInstance>
    where
        F: FnOnce(&mut WorkerInstance) -> StateResult<()>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let worker = {
            let mut table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
            let mut worker: WorkerInstance = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(format!("worker {id}"))),
            };
            apply(&mut worker)?;
            let value = serde_json::to_vec(&worker).map_err(map_err!(Serialize))?;
            table.insert(id, value.as_slice()).map_err(map_err!(Write))?;
            worker
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(worker)
    }

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn scan_json<T: DeserializeOwned>(&self, def: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }
}
