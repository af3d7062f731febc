//! Fleet backed by an on-demand sandbox.
//!
//! Workers are the sandbox's containers named `<prefix><N>` with `N` in
//! `[0, max_workers)`. Scaling rewrites the sandbox definition: a new
//! worker is a copy of the first worker container under the lowest free
//! index, and removal drops the container. Edits go through the sandbox
//! CLI (`cs -o json sandbox show|edit`) and are acknowledged as soon as
//! the edit succeeds.
//!
//! The definition carries no lifecycle, so a worker is Provisioning until
//! its metrics port first answers and Ready from then on. The last time it
//! answered is its heartbeat. The last worker container is never removed:
//! it is the template every new worker is copied from.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use farmscale_core::{BoxFuture, Clock};
use farmscale_state::{OperationId, OperationStatus, WorkerInstance, WorkerState};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::actuator::FleetActuator;
use crate::error::{FleetError, FleetResult};
use crate::inventory::FleetInventory;

/// Reads and replaces the sandbox definition.
pub trait SandboxCli: Send + Sync {
    fn show(&self) -> BoxFuture<'_, FleetResult<Value>>;
    fn edit<'a>(&'a self, definition: &'a Value) -> BoxFuture<'a, FleetResult<()>>;
}

/// Invokes the sandbox CLI binary. A call that outlives `timeout` is
/// abandoned and the child process killed.
pub struct CsCli {
    program: String,
    sandbox: String,
    timeout: Duration,
}

impl CsCli {
    pub fn new(program: &str, sandbox: &str, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            sandbox: sandbox.to_string(),
            timeout,
        }
    }

    async fn bounded<T>(
        &self,
        what: &str,
        call: impl Future<Output = FleetResult<T>>,
    ) -> FleetResult<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| FleetError::Timeout(format!("sandbox {what} after {:?}", self.timeout)))?
    }
}

impl SandboxCli for CsCli {
    fn show(&self) -> BoxFuture<'_, FleetResult<Value>> {
        Box::pin(self.bounded("show", async move {
            let output = Command::new(&self.program)
                .args(["-o", "json", "sandbox", "show", &self.sandbox, "--def"])
                .kill_on_drop(true)
                .output()
                .await?;
            if !output.status.success() {
                return Err(FleetError::Cli {
                    code: output.status.code().unwrap_or(-1),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            serde_json::from_slice(&output.stdout)
                .map_err(|e| FleetError::Definition(e.to_string()))
        }))
    }

    fn edit<'a>(&'a self, definition: &'a Value) -> BoxFuture<'a, FleetResult<()>> {
        Box::pin(self.bounded("edit", async move {
            let input =
                serde_json::to_vec(definition).map_err(|e| FleetError::Definition(e.to_string()))?;
            let mut child = Command::new(&self.program)
                .args(["-o", "json", "sandbox", "edit", "--force", "--from", "-"])
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(&input).await?;
            }
            let output = child.wait_with_output().await?;
            if !output.status.success() {
                return Err(FleetError::Cli {
                    code: output.status.code().unwrap_or(-1),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            Ok(())
        }))
    }
}

/// Answers whether a worker container is up.
pub type ReachabilityCheck = Arc<dyn Fn(String) -> BoxFuture<'static, bool> + Send + Sync>;

/// Reachability by TCP connect to the worker's metrics port.
pub fn tcp_reachability(port: u16, timeout: Duration) -> ReachabilityCheck {
    Arc::new(move |name: String| -> BoxFuture<'static, bool> {
        Box::pin(async move {
            let addr = format!("{name}:{port}");
            matches!(
                tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await,
                Ok(Ok(_))
            )
        })
    })
}

#[derive(Default)]
struct Observed {
    first_seen: HashMap<String, u64>,
    last_reached: HashMap<String, u64>,
    /// Drain start per container.
    draining: HashMap<String, u64>,
    /// Status and creation time per operation.
    operations: HashMap<OperationId, (OperationStatus, u64)>,
    next_op: u64,
}

impl Observed {
    fn record_op(&mut self, status: OperationStatus, now: u64) -> OperationId {
        self.next_op += 1;
        let id = format!("sandbox-op-{}", self.next_op);
        self.operations.insert(id.clone(), (status, now));
        id
    }

    fn prune_operations(&mut self, retention_secs: u64, now: u64) -> u32 {
        let before = self.operations.len();
        self.operations.retain(|_, (status, created_at)| {
            *status == OperationStatus::Pending || now.saturating_sub(*created_at) <= retention_secs
        });
        (before - self.operations.len()) as u32
    }

    /// Drop bookkeeping for containers that left the definition.
    fn retain_present(&mut self, present: &HashSet<String>) {
        self.first_seen.retain(|k, _| present.contains(k));
        self.last_reached.retain(|k, _| present.contains(k));
        self.draining.retain(|k, _| present.contains(k));
    }
}

pub struct SandboxFleet {
    cli: Arc<dyn SandboxCli>,
    queue: String,
    prefix: String,
    max_workers: u32,
    reachable: ReachabilityCheck,
    clock: Arc<dyn Clock>,
    /// Also serializes definition edits.
    observed: Mutex<Observed>,
}

impl SandboxFleet {
    pub fn new(
        cli: Arc<dyn SandboxCli>,
        queue: &str,
        prefix: &str,
        max_workers: u32,
        reachable: ReachabilityCheck,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cli,
            queue: queue.to_string(),
            prefix: prefix.to_string(),
            max_workers,
            reachable,
            clock,
            observed: Mutex::new(Observed::default()),
        }
    }

    fn check_queue(&self, queue: &str) -> FleetResult<()> {
        if queue == self.queue {
            Ok(())
        } else {
            Err(FleetError::UnknownQueue(queue.to_string()))
        }
    }

    fn worker_names(&self, definition: &Value) -> FleetResult<Vec<String>> {
        Ok(containers(definition)?
            .iter()
            .filter_map(|c| c.get("name").and_then(Value::as_str))
            .filter(|name| name.starts_with(&self.prefix))
            .map(str::to_string)
            .collect())
    }

    async fn list_now(&self) -> FleetResult<Vec<WorkerInstance>> {
        let definition = self.cli.show().await?;
        let names = self.worker_names(&definition)?;

        let mut reached = Vec::with_capacity(names.len());
        for name in &names {
            reached.push((self.reachable)(name.clone()).await);
        }

        let now = self.clock.now();
        let mut observed = self.observed.lock().await;
        observed.retain_present(&names.iter().cloned().collect());

        let mut workers = Vec::with_capacity(names.len());
        for (name, up) in names.iter().zip(reached) {
            let created_at = *observed.first_seen.entry(name.clone()).or_insert(now);
            if up {
                observed.last_reached.insert(name.clone(), now);
            }
            let last_heartbeat = observed.last_reached.get(name).copied();
            let drain_started_at = observed.draining.get(name).copied();
            let state = if drain_started_at.is_some() {
                WorkerState::Draining
            } else if last_heartbeat.is_some() {
                WorkerState::Ready
            } else {
                WorkerState::Provisioning
            };
            workers.push(WorkerInstance {
                id: name.clone(),
                queue: self.queue.clone(),
                state,
                created_at,
                last_heartbeat,
                drain_started_at,
                terminated_at: None,
            });
        }
        workers.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| worker_index(&a.id, &self.prefix).cmp(&worker_index(&b.id, &self.prefix)))
        });
        Ok(workers)
    }

    async fn provision_now(&self, queue: &str, count: u32) -> FleetResult<OperationId> {
        self.check_queue(queue)?;
        let mut observed = self.observed.lock().await;
        let mut definition = self.cli.show().await?;
        let names: HashSet<String> = self.worker_names(&definition)?.into_iter().collect();

        let template = containers(&definition)?
            .iter()
            .find(|c| {
                c.get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|n| n.starts_with(&self.prefix))
            })
            .cloned()
            .ok_or_else(|| FleetError::Definition("no worker container to copy".into()))?;

        let free: Vec<String> = (0..self.max_workers)
            .map(|i| format!("{}{i}", self.prefix))
            .filter(|name| !names.contains(name))
            .take(count as usize)
            .collect();
        if free.is_empty() {
            return Err(FleetError::CapacityExhausted(queue.to_string()));
        }

        let list = containers_mut(&mut definition)?;
        for name in &free {
            let mut worker = template.clone();
            worker["name"] = Value::String(name.clone());
            list.push(worker);
        }
        self.cli.edit(&definition).await?;

        info!(%queue, added = %free.join(","), "workers added to sandbox");
        Ok(observed.record_op(OperationStatus::Acknowledged, self.clock.now()))
    }

    async fn terminate_now(&self, instance: &str) -> FleetResult<OperationId> {
        let mut observed = self.observed.lock().await;
        let mut definition = self.cli.show().await?;
        let workers = self.worker_names(&definition)?;
        if workers.len() == 1 && workers[0] == instance {
            return Err(FleetError::Definition(format!(
                "refusing to remove {instance}, the last worker container"
            )));
        }
        let list = containers_mut(&mut definition)?;
        let before = list.len();
        list.retain(|c| c.get("name").and_then(Value::as_str) != Some(instance));

        if list.len() == before {
            debug!(%instance, "terminate on absent worker");
        } else {
            self.cli.edit(&definition).await?;
            observed.draining.remove(instance);
            info!(%instance, "worker removed from sandbox");
        }
        Ok(observed.record_op(OperationStatus::Acknowledged, self.clock.now()))
    }
}

impl FleetInventory for SandboxFleet {
    fn list<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, FleetResult<Vec<WorkerInstance>>> {
        Box::pin(async move {
            self.check_queue(queue)?;
            self.list_now().await
        })
    }

    fn observe<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, FleetResult<Option<WorkerState>>> {
        Box::pin(async move {
            let workers = self.list_now().await?;
            Ok(workers.into_iter().find(|w| w.id == instance).map(|w| w.state))
        })
    }

    fn prune_terminated(&self, retention_secs: u64) -> BoxFuture<'_, FleetResult<u32>> {
        // Removed containers leave no record behind; only operations pile up.
        Box::pin(async move {
            let now = self.clock.now();
            Ok(self.observed.lock().await.prune_operations(retention_secs, now))
        })
    }
}

impl FleetActuator for SandboxFleet {
    fn provision<'a>(&'a self, queue: &'a str, count: u32) -> BoxFuture<'a, FleetResult<OperationId>> {
        Box::pin(self.provision_now(queue, count))
    }

    fn terminate<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, FleetResult<OperationId>> {
        Box::pin(self.terminate_now(instance))
    }

    fn status<'a>(&'a self, operation: &'a str) -> BoxFuture<'a, FleetResult<OperationStatus>> {
        Box::pin(async move {
            let observed = self.observed.lock().await;
            observed
                .operations
                .get(operation)
                .map(|(status, _)| *status)
                .ok_or_else(|| FleetError::UnknownOperation(operation.to_string()))
        })
    }

    fn begin_drain<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, FleetResult<()>> {
        Box::pin(async move {
            let now = self.clock.now();
            self.observed
                .lock()
                .await
                .draining
                .entry(instance.to_string())
                .or_insert(now);
            Ok(())
        })
    }
}

fn containers(definition: &Value) -> FleetResult<&Vec<Value>> {
    definition
        .get("containers")
        .and_then(Value::as_array)
        .ok_or_else(|| FleetError::Definition("missing containers".into()))
}

fn containers_mut(definition: &mut Value) -> FleetResult<&mut Vec<Value>> {
    definition
        .get_mut("containers")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| FleetError::Definition("missing containers".into()))
}

fn worker_index(name: &str, prefix: &str) -> u64 {
    name.strip_prefix(prefix)
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX)
}
