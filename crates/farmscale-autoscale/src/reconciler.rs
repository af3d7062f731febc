//! The control loop.
//!
//! A tick settles outstanding intents against the inventory, then offers
//! every due queue to the policy. Queues are evaluated concurrently and
//! independently; a failing queue never holds up the others. Issued
//! intents are carried out by spawned actuation tasks so a slow actuator
//! never stretches a tick. An actuation that outlives its deadline is
//! aborted and its intent expired.
//!
//! An idle queue also reclaims workers no intent answers for: workers left
//! Draining by an interrupted scale-down, and workers that never became or
//! stopped being usable capacity.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use farmscale_backplane::{BackplaneProbe, CachedProbe};
use farmscale_core::{ActuationConfig, Clock, ControllerConfig, FarmscaleConfig, QueueSettings};
use farmscale_fleet::{FleetActuator, FleetInventory};
use farmscale_state::{
    FleetSnapshot, InstanceId, IntentStatus, OperationId, OperationStatus, ScaleDirection,
    ScaleIntent, WorkerInstance, WorkerState,
};
use tokio::sync::{Mutex, watch};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backoff::{bounded, with_retry};
use crate::events::{EventKind, EventLog, ScaleEvent};
use crate::policy::Hold;
use crate::readiness::Readiness;
use crate::tracker::{Evaluation, IntentTracker, QueuePhase};

const EVENT_CAPACITY: usize = 512;

/// What a tick did for one queue.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueOutcome {
    /// An intent is still being carried out.
    Busy(QueuePhase),
    /// The queue's own tick interval has not elapsed.
    NotDue,
    Held(Hold),
    Issued(ScaleIntent),
    /// The outstanding intent landed in the inventory.
    Completed(ScaleIntent),
    /// The outstanding intent did not land in time.
    Expired(ScaleIntent),
    ProbeFailed(String),
    InventoryFailed(String),
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub at: u64,
    /// Per-queue outcomes, sorted by queue name.
    pub outcomes: Vec<(String, QueueOutcome)>,
    pub pruned: u32,
}

impl TickReport {
    pub fn outcome(&self, queue: &str) -> Option<&QueueOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == queue)
            .map(|(_, outcome)| outcome)
    }
}

struct Shared {
    queues: Vec<QueueSettings>,
    controller: ControllerConfig,
    probe: CachedProbe,
    inventory: Arc<dyn FleetInventory>,
    actuator: Arc<dyn FleetActuator>,
    clock: Arc<dyn Clock>,
    tracker: IntentTracker,
    events: EventLog,
    readiness: Readiness,
    tick_interval_secs: u64,
    actuations: Mutex<Actuations>,
}

#[derive(Default)]
struct Actuations {
    tasks: JoinSet<()>,
    /// Latest actuation per queue.
    by_queue: HashMap<String, AbortHandle>,
}

/// Drives the queues of one farm. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Reconciler {
    shared: Arc<Shared>,
}

impl Reconciler {
    pub fn new(
        config: &FarmscaleConfig,
        probe: Arc<dyn BackplaneProbe>,
        inventory: Arc<dyn FleetInventory>,
        actuator: Arc<dyn FleetActuator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queues = config.queue_settings();
        let tick_interval_secs = config.tick_interval_secs();
        let tracker = IntentTracker::new(
            queues.iter().map(|q| q.name.as_str()),
            config.controller.trend_window,
        );
        Self {
            shared: Arc::new(Shared {
                probe: CachedProbe::new(probe, config.controller.staleness_threshold_secs),
                controller: config.controller.clone(),
                queues,
                inventory,
                actuator,
                clock,
                tracker,
                events: EventLog::new(EVENT_CAPACITY),
                readiness: Readiness::new(tick_interval_secs),
                tick_interval_secs,
                actuations: Mutex::new(Actuations::default()),
            }),
        }
    }

    pub fn queues(&self) -> &[QueueSettings] {
        &self.shared.queues
    }

    pub fn tracker(&self) -> &IntentTracker {
        &self.shared.tracker
    }

    pub fn events(&self) -> &EventLog {
        &self.shared.events
    }

    pub fn readiness(&self) -> &Readiness {
        &self.shared.readiness
    }

    pub fn probe(&self) -> &CachedProbe {
        &self.shared.probe
    }

    pub fn now(&self) -> u64 {
        self.shared.clock.now()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.shared.tick_interval_secs)
    }

    /// Run one reconcile pass over every queue.
    pub async fn tick(&self) -> TickReport {
        let now = self.shared.clock.now();
        self.reap_actuations().await;

        let prune = self
            .shared
            .inventory
            .prune_terminated(self.shared.controller.retention_secs);
        let pruned = match bounded(&self.shared.controller.actuation, "prune", prune).await {
            Ok(n) => {
                if n > 0 {
                    debug!(pruned = n, "pruned terminated workers and settled operations");
                }
                n
            }
            Err(e) => {
                warn!(error = %e, "pruning fleet records failed");
                0
            }
        };

        let mut set = JoinSet::new();
        for settings in &self.shared.queues {
            let shared = Arc::clone(&self.shared);
            let settings = settings.clone();
            set.spawn(async move {
                let outcome = reconcile_queue(&shared, &settings, now).await;
                (settings.name, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(self.shared.queues.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(pair) => outcomes.push(pair),
                Err(e) => error!(error = %e, "queue evaluation task failed"),
            }
        }
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));

        self.shared.readiness.mark_tick(self.shared.clock.now());
        TickReport {
            at: now,
            outcomes,
            pruned,
        }
    }

    /// Wait for every in-flight actuation to finish.
    pub async fn settle(&self) {
        loop {
            let mut running = std::mem::take(&mut self.shared.actuations.lock().await.tasks);
            if running.is_empty() {
                return;
            }
            while let Some(joined) = running.join_next().await {
                log_join_error(joined);
            }
        }
    }

    /// Abort in-flight actuations. Operations already accepted by the
    /// actuator keep going; the next controller run sees their effect in
    /// the inventory.
    pub async fn abort_actuations(&self) {
        let mut actuations = self.shared.actuations.lock().await;
        if !actuations.tasks.is_empty() {
            info!(count = actuations.tasks.len(), "aborting in-flight actuations");
        }
        actuations.by_queue.clear();
        actuations.tasks.shutdown().await;
    }

    /// Tick on a fixed interval until `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.tick_interval();
        info!(
            interval_secs = interval.as_secs(),
            queues = self.shared.queues.len(),
            "reconciler started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    debug!(at = report.at, queues = report.outcomes.len(), "tick complete");
                }
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    break;
                }
            }
        }
        self.abort_actuations().await;
    }

    async fn reap_actuations(&self) {
        let mut actuations = self.shared.actuations.lock().await;
        while let Some(joined) = actuations.tasks.try_join_next() {
            log_join_error(joined);
        }
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined
        && e.is_panic()
    {
        error!(error = %e, "actuation task panicked");
    }
}

async fn reconcile_queue(shared: &Arc<Shared>, settings: &QueueSettings, now: u64) -> QueueOutcome {
    let queue = settings.name.as_str();

    if let Some(intent) = shared.tracker.outstanding(queue).await {
        return settle_outstanding(shared, intent, settings, now).await;
    }
    if !shared
        .tracker
        .is_due(queue, settings.scaling.tick_interval_secs, now)
        .await
    {
        return QueueOutcome::NotDue;
    }

    let sample = match shared.probe.sample(queue, now).await {
        Ok(sample) => sample,
        Err(e) => return QueueOutcome::ProbeFailed(e.to_string()),
    };
    let mut workers = match list_workers(shared, queue).await {
        Ok(workers) => workers,
        Err(outcome) => return outcome,
    };
    if reap_workers(shared, settings, &workers, now).await {
        workers = match list_workers(shared, queue).await {
            Ok(workers) => workers,
            Err(outcome) => return outcome,
        };
    }
    let snapshot = FleetSnapshot::new(
        queue,
        sample.depth,
        sample.sampled_at,
        sample.stale,
        workers,
        now,
        shared.controller.heartbeat_timeout_secs,
    );
    debug!(
        %queue,
        pending = snapshot.depth.pending,
        in_progress = snapshot.depth.in_progress,
        ready = snapshot.ready_count(),
        provisioning = snapshot.provisioning_count(),
        stale = snapshot.stale,
        "queue sampled"
    );

    match shared.tracker.try_begin(snapshot, &settings.scaling, now).await {
        Ok(Evaluation::Issued(intent)) => {
            info!(
                %queue,
                direction = %intent.direction,
                delta = intent.delta,
                expected = intent.expected_count,
                "scale intent issued"
            );
            shared
                .events
                .record(ScaleEvent::for_intent(EventKind::IntentIssued, &intent, now))
                .await;
            spawn_actuation(shared, intent.clone(), settings.scaling.drain_grace_secs).await;
            QueueOutcome::Issued(intent)
        }
        Ok(Evaluation::Held(hold)) => {
            debug!(%queue, reason = %hold, "no scaling");
            QueueOutcome::Held(hold)
        }
        Ok(Evaluation::Busy(phase)) => QueueOutcome::Busy(phase),
        Ok(Evaluation::NotDue) => QueueOutcome::NotDue,
        Err(e) => {
            error!(%queue, error = %e, "queue state rejected the evaluation");
            QueueOutcome::Busy(shared.tracker.phase(queue).await.unwrap_or(QueuePhase::Idle))
        }
    }
}

async fn list_workers(shared: &Shared, queue: &str) -> Result<Vec<WorkerInstance>, QueueOutcome> {
    bounded(&shared.controller.actuation, "list", shared.inventory.list(queue))
        .await
        .map_err(|e| {
            warn!(%queue, error = %e, "inventory read failed");
            QueueOutcome::InventoryFailed(e.to_string())
        })
}

/// Terminate Draining workers that are idle or past their grace period,
/// and stranded workers. Only runs while the queue has no outstanding
/// intent, so every Draining worker seen here has been abandoned. Returns
/// whether any worker was terminated.
async fn reap_workers(
    shared: &Shared,
    settings: &QueueSettings,
    workers: &[WorkerInstance],
    now: u64,
) -> bool {
    let queue = settings.name.as_str();
    let grace_secs = settings.scaling.drain_grace_secs;
    let retire_after_secs = shared.controller.retire_after_secs;

    let mut drained = Vec::new();
    let mut forced = Vec::new();
    let mut retired = Vec::new();
    for worker in workers {
        if worker.state == WorkerState::Draining {
            if shared.probe.instance_in_progress(queue, &worker.id).await == Some(0) {
                drained.push(worker.id.clone());
            } else if worker.drain_expired(now, grace_secs) {
                forced.push(worker.id.clone());
            }
        } else if worker.is_stranded(now, retire_after_secs) {
            retired.push(worker.id.clone());
        }
    }
    if drained.is_empty() && forced.is_empty() && retired.is_empty() {
        return false;
    }

    let drained = terminate_all(shared, &drained).await;
    let forced = terminate_all(shared, &forced).await;
    let retired = terminate_all(shared, &retired).await;
    let at = shared.clock.now();

    if !forced.is_empty() {
        shared
            .events
            .record(
                ScaleEvent::for_workers(EventKind::DrainForced, queue, forced.clone(), at)
                    .with_detail(format!("abandoned drain outlived the {grace_secs}s grace")),
            )
            .await;
    }
    let terminated: Vec<InstanceId> = drained.into_iter().chain(forced).collect();
    if !terminated.is_empty() {
        info!(%queue, workers = ?terminated, "abandoned draining workers terminated");
        shared
            .events
            .record(ScaleEvent::for_workers(EventKind::WorkerTerminated, queue, terminated, at))
            .await;
    }
    if !retired.is_empty() {
        shared
            .events
            .record(
                ScaleEvent::for_workers(EventKind::WorkerRetired, queue, retired, at)
                    .with_detail(format!("no heartbeat within {retire_after_secs}s")),
            )
            .await;
    }
    true
}

/// Terminate each instance, retrying per the actuation settings. Returns
/// the instances that were terminated.
async fn terminate_all(shared: &Shared, instances: &[InstanceId]) -> Vec<InstanceId> {
    let config = &shared.controller.actuation;
    let actuator = &shared.actuator;
    let mut done = Vec::with_capacity(instances.len());
    for instance in instances {
        let id = instance.as_str();
        match with_retry(config, "terminate", id, || actuator.terminate(id)).await {
            Ok(_) => done.push(instance.clone()),
            Err(e) => warn!(instance = %id, error = %e, "could not terminate worker"),
        }
    }
    done
}

/// Latest time the actuation for `intent` can still be making progress.
/// Each retried call and each status round is bounded by the retry budget.
fn actuation_deadline(intent: &ScaleIntent, controller: &ControllerConfig, drain_grace_secs: u64) -> u64 {
    let actuation = &controller.actuation;
    let (calls, grace) = match intent.direction {
        ScaleDirection::Up => (2, 0),
        ScaleDirection::Down => (3 * u64::from(intent.delta.max(1)), drain_grace_secs),
    };
    intent
        .issued_at
        .saturating_add(actuation.ack_timeout_secs)
        .saturating_add(grace)
        .saturating_add(actuation.retry_budget_secs().saturating_mul(calls))
}

async fn abort_actuation(shared: &Shared, queue: &str) {
    if let Some(handle) = shared.actuations.lock().await.by_queue.remove(queue) {
        handle.abort();
    }
}

/// Resolve an acknowledged intent once the inventory shows it landed, or
/// expire it once it has been outstanding too long. An intent whose
/// actuation never finishes is expired at its deadline and the task aborted.
async fn settle_outstanding(
    shared: &Arc<Shared>,
    intent: ScaleIntent,
    settings: &QueueSettings,
    now: u64,
) -> QueueOutcome {
    let queue = intent.queue.as_str();
    let phase = match intent.direction {
        ScaleDirection::Up => QueuePhase::ScalingUp,
        ScaleDirection::Down => QueuePhase::ScalingDown,
    };
    if intent.status != IntentStatus::Acknowledged {
        let deadline = actuation_deadline(&intent, &shared.controller, settings.scaling.drain_grace_secs);
        if now < deadline {
            return QueueOutcome::Busy(phase);
        }
        abort_actuation(shared, queue).await;
        let detail = format!(
            "actuation still running after {}s",
            now.saturating_sub(intent.issued_at)
        );
        return match finish(shared, &intent, IntentStatus::Expired, Some(detail)).await {
            Some(expired) => QueueOutcome::Expired(expired),
            None => QueueOutcome::Busy(phase),
        };
    }

    match landed(shared, &intent).await {
        Ok(true) => {
            if let Some(done) = finish(shared, &intent, IntentStatus::Acknowledged, None).await {
                info!(%queue, direction = %done.direction, delta = done.delta, "scale intent completed");
                shared
                    .events
                    .record(ScaleEvent::for_intent(EventKind::IntentCompleted, &done, now))
                    .await;
                return QueueOutcome::Completed(done);
            }
            QueueOutcome::Busy(phase)
        }
        Ok(false) => {
            let mut deadline = intent.issued_at + shared.controller.actuation.ack_timeout_secs;
            if intent.direction == ScaleDirection::Down {
                deadline += settings.scaling.drain_grace_secs;
            }
            if now < deadline {
                return QueueOutcome::Busy(phase);
            }
            let detail = format!("not visible in inventory after {}s", now - intent.issued_at);
            match finish(shared, &intent, IntentStatus::Expired, Some(detail)).await {
                Some(expired) => QueueOutcome::Expired(expired),
                None => QueueOutcome::Busy(phase),
            }
        }
        Err(e) => {
            warn!(%queue, error = %e, "inventory read failed");
            QueueOutcome::InventoryFailed(e.to_string())
        }
    }
}

/// Whether the inventory reflects `intent`.
async fn landed(shared: &Arc<Shared>, intent: &ScaleIntent) -> farmscale_fleet::FleetResult<bool> {
    let config = &shared.controller.actuation;
    match intent.direction {
        ScaleDirection::Up => {
            let workers = bounded(config, "list", shared.inventory.list(&intent.queue)).await?;
            let live = workers
                .iter()
                .filter(|w| w.state != WorkerState::Terminated)
                .count() as u32;
            Ok(live >= intent.expected_count)
        }
        ScaleDirection::Down => {
            for target in &intent.targets {
                match bounded(config, "observe", shared.inventory.observe(target)).await? {
                    None | Some(WorkerState::Terminated) => {}
                    Some(_) => return Ok(false),
                }
            }
            Ok(true)
        }
    }
}

/// Close `intent` with `status` and log failures. Returns the closed
/// intent, or `None` if it was no longer outstanding.
async fn finish(
    shared: &Shared,
    intent: &ScaleIntent,
    status: IntentStatus,
    detail: Option<String>,
) -> Option<ScaleIntent> {
    let closed = match shared
        .tracker
        .resolve(&intent.queue, intent.issued_at, status)
        .await
    {
        Ok(closed) => closed?,
        Err(e) => {
            error!(queue = %intent.queue, error = %e, "could not resolve intent");
            return None;
        }
    };

    let kind = match status {
        IntentStatus::Failed => EventKind::IntentFailed,
        IntentStatus::Expired => EventKind::IntentExpired,
        IntentStatus::Pending | IntentStatus::Acknowledged => return Some(closed),
    };
    let mut event = ScaleEvent::for_intent(kind, &closed, shared.clock.now());
    if let Some(detail) = detail {
        event = event.with_detail(detail);
    }
    shared.events.record(event).await;
    Some(closed)
}

async fn spawn_actuation(shared: &Arc<Shared>, intent: ScaleIntent, drain_grace_secs: u64) {
    let task_shared = Arc::clone(shared);
    let queue = intent.queue.clone();
    let mut actuations = shared.actuations.lock().await;
    let handle = actuations.tasks.spawn(async move {
        match intent.direction {
            ScaleDirection::Up => scale_up(&task_shared, intent).await,
            ScaleDirection::Down => scale_down(&task_shared, intent, drain_grace_secs).await,
        }
    });
    actuations.by_queue.insert(queue, handle);
}

async fn scale_up(shared: &Shared, intent: ScaleIntent) {
    let config = &shared.controller.actuation;
    let queue = intent.queue.as_str();
    let actuator = &shared.actuator;

    let op = match with_retry(config, "provision", queue, || actuator.provision(queue, intent.delta)).await {
        Ok(op) => op,
        Err(e) => {
            finish(shared, &intent, IntentStatus::Failed, Some(format!("provision: {e}"))).await;
            return;
        }
    };
    debug!(%queue, operation = %op, count = intent.delta, "provision accepted");
    shared
        .tracker
        .update(queue, intent.issued_at, |i| i.operations.push(op.clone()))
        .await;

    complete_operations(shared, &intent, vec![op]).await;
}

async fn scale_down(shared: &Shared, intent: ScaleIntent, drain_grace_secs: u64) {
    let config = &shared.controller.actuation;
    let queue = intent.queue.as_str();
    let actuator = &shared.actuator;

    for victim in &intent.targets {
        let victim = victim.as_str();
        if let Err(e) = with_retry(config, "begin_drain", victim, || actuator.begin_drain(victim)).await {
            finish(shared, &intent, IntentStatus::Failed, Some(format!("drain {victim}: {e}"))).await;
            return;
        }
    }
    shared
        .events
        .record(ScaleEvent::for_workers(
            EventKind::DrainStarted,
            queue,
            intent.targets.clone(),
            shared.clock.now(),
        ))
        .await;

    let busy = wait_for_drain(shared, queue, &intent.targets, drain_grace_secs, config).await;
    if !busy.is_empty() {
        shared
            .events
            .record(
                ScaleEvent::for_workers(EventKind::DrainForced, queue, busy, shared.clock.now())
                    .with_detail(format!("work still in flight after {drain_grace_secs}s grace")),
            )
            .await;
    }

    let mut ops = Vec::with_capacity(intent.targets.len());
    for victim in &intent.targets {
        let victim = victim.as_str();
        match with_retry(config, "terminate", victim, || actuator.terminate(victim)).await {
            Ok(op) => ops.push(op),
            Err(e) => {
                finish(shared, &intent, IntentStatus::Failed, Some(format!("terminate {victim}: {e}")))
                    .await;
                return;
            }
        }
    }
    shared
        .tracker
        .update(queue, intent.issued_at, |i| i.operations.extend(ops.iter().cloned()))
        .await;
    shared
        .events
        .record(ScaleEvent::for_workers(
            EventKind::WorkerTerminated,
            queue,
            intent.targets.clone(),
            shared.clock.now(),
        ))
        .await;

    complete_operations(shared, &intent, ops).await;
}

/// Poll until every target reports nothing in flight or the grace period
/// ends. Returns the targets that were still busy.
async fn wait_for_drain(
    shared: &Shared,
    queue: &str,
    targets: &[InstanceId],
    grace_secs: u64,
    config: &ActuationConfig,
) -> Vec<InstanceId> {
    let started = shared.clock.now();
    let poll = Duration::from_millis(config.status_poll_ms);
    loop {
        let mut busy = Vec::new();
        for target in targets {
            let in_flight = match shared.probe.instance_in_progress(queue, target).await {
                Some(n) => n,
                // Per-worker counts unavailable: fall back to the queue.
                None => match shared.probe.sample(queue, shared.clock.now()).await {
                    Ok(sample) => sample.depth.in_progress,
                    Err(_) => 1,
                },
            };
            if in_flight > 0 {
                busy.push(target.clone());
            }
        }

        if busy.is_empty() {
            debug!(%queue, "drain complete");
            return busy;
        }
        if shared.clock.now().saturating_sub(started) >= grace_secs {
            return busy;
        }
        tokio::time::sleep(poll).await;
    }
}

/// Poll operation status until all are acknowledged, one fails, or the
/// acknowledgement timeout passes; then record the result on the intent.
async fn complete_operations(shared: &Shared, intent: &ScaleIntent, ops: Vec<OperationId>) {
    let config = &shared.controller.actuation;
    let queue = intent.queue.as_str();
    let started = shared.clock.now();
    let poll = Duration::from_millis(config.status_poll_ms);

    let mut waiting = ops;
    loop {
        let mut still_waiting = Vec::new();
        for op in waiting {
            match bounded(config, "status", shared.actuator.status(&op)).await {
                Ok(OperationStatus::Acknowledged) => {}
                Ok(OperationStatus::Pending) => still_waiting.push(op),
                Ok(OperationStatus::Failed) => {
                    finish(shared, intent, IntentStatus::Failed, Some(format!("operation {op} failed")))
                        .await;
                    return;
                }
                Err(e) => {
                    debug!(%queue, operation = %op, error = %e, "status read failed");
                    still_waiting.push(op);
                }
            }
        }

        if still_waiting.is_empty() {
            break;
        }
        if shared.clock.now().saturating_sub(started) >= config.ack_timeout_secs {
            let detail = format!("{} operation(s) unacknowledged", still_waiting.len());
            finish(shared, intent, IntentStatus::Expired, Some(detail)).await;
            return;
        }
        waiting = still_waiting;
        tokio::time::sleep(poll).await;
    }

    let acknowledged = shared
        .tracker
        .update(queue, intent.issued_at, |i| i.status = IntentStatus::Acknowledged)
        .await;
    if acknowledged {
        shared
            .events
            .record(ScaleEvent::for_intent(
                EventKind::IntentAcknowledged,
                intent,
                shared.clock.now(),
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use farmscale_backplane::StoreBackplane;
    use farmscale_core::{BoxFuture, ManualClock};
    use farmscale_fleet::{FleetError, FleetResult, LocalFleet};
    use farmscale_state::{FarmStore, QueueDepth};

    const BASE: &str = r#"
[controller]
trend_window = 1

[controller.actuation]
max_attempts = 2
backoff_base_ms = 1
backoff_max_ms = 2
ack_timeout_secs = 30
status_poll_ms = 1

[defaults]
min_replicas = 0
max_replicas = 10
scale_up_cooldown_secs = 0
scale_down_cooldown_secs = 0
drain_grace_secs = 0
tick_interval_secs = 5
"#;

    struct Farm {
        store: FarmStore,
        clock: Arc<ManualClock>,
        fleet: Arc<LocalFleet>,
        reconciler: Reconciler,
    }

    impl Farm {
        fn set_depth(&self, queue: &str, pending: u64, in_progress: u64) {
            self.store
                .set_queue_depth(queue, QueueDepth::new(pending, in_progress), self.clock.now())
                .unwrap();
        }

        /// Provision `count` workers that heartbeat right away.
        async fn ready_workers(&self, queue: &str, count: u32, load: u64) -> Vec<String> {
            self.fleet.provision(queue, count).await.unwrap();
            let workers = self.fleet.list(queue).await.unwrap();
            for w in &workers {
                self.store.record_heartbeat(&w.id, self.clock.now()).unwrap();
                self.store.set_worker_load(&w.id, load).unwrap();
            }
            workers.into_iter().map(|w| w.id).collect()
        }

        fn advance(&self, secs: u64) {
            self.clock.advance(secs);
        }

        /// A fresh controller over the same fleet, as after a process restart.
        fn restart(&self, config: &FarmscaleConfig) -> Reconciler {
            Reconciler::new(
                config,
                Arc::new(StoreBackplane::new(self.store.clone())),
                self.fleet.clone(),
                self.fleet.clone(),
                self.clock.clone(),
            )
        }
    }

    fn config(queues: &str) -> FarmscaleConfig {
        FarmscaleConfig::from_toml_str(&format!("{BASE}\n{queues}")).unwrap()
    }

    fn farm_with(config: &FarmscaleConfig, registered: &[&str], actuator: Option<Arc<dyn FleetActuator>>) -> Farm {
        let store = FarmStore::open_in_memory().unwrap();
        for queue in registered {
            store.ensure_queue(queue, &[], 1_000).unwrap();
        }
        let clock = Arc::new(ManualClock::new(1_000));
        let fleet = Arc::new(LocalFleet::new(store.clone(), clock.clone()));
        let actuator: Arc<dyn FleetActuator> = match actuator {
            Some(actuator) => actuator,
            None => fleet.clone(),
        };
        let reconciler = Reconciler::new(
            config,
            Arc::new(StoreBackplane::new(store.clone())),
            fleet.clone(),
            actuator,
            clock.clone(),
        );
        Farm {
            store,
            clock,
            fleet,
            reconciler,
        }
    }

    fn farm(queues: &str) -> Farm {
        let config = config(queues);
        let names: Vec<String> = config.queues.iter().map(|q| q.name.clone()).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        farm_with(&config, &names, None)
    }

    /// Rejects every call.
    #[derive(Default)]
    struct FailingActuator {
        calls: AtomicU32,
    }

    impl FailingActuator {
        fn reject<'a, T: Send + 'a>(&self) -> BoxFuture<'a, FleetResult<T>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(FleetError::CapacityExhausted("cpu".into())) })
        }
    }

    impl FleetActuator for FailingActuator {
        fn provision<'a>(&'a self, _queue: &'a str, _count: u32) -> BoxFuture<'a, FleetResult<OperationId>> {
            self.reject()
        }

        fn terminate<'a>(&'a self, _instance: &'a str) -> BoxFuture<'a, FleetResult<OperationId>> {
            self.reject()
        }

        fn status<'a>(&'a self, _operation: &'a str) -> BoxFuture<'a, FleetResult<OperationStatus>> {
            self.reject()
        }

        fn begin_drain<'a>(&'a self, _instance: &'a str) -> BoxFuture<'a, FleetResult<()>> {
            self.reject()
        }
    }

    /// Accepts every call and never answers.
    struct HangingActuator;

    impl FleetActuator for HangingActuator {
        fn provision<'a>(&'a self, _queue: &'a str, _count: u32) -> BoxFuture<'a, FleetResult<OperationId>> {
            Box::pin(std::future::pending())
        }

        fn terminate<'a>(&'a self, _instance: &'a str) -> BoxFuture<'a, FleetResult<OperationId>> {
            Box::pin(std::future::pending())
        }

        fn status<'a>(&'a self, _operation: &'a str) -> BoxFuture<'a, FleetResult<OperationStatus>> {
            Box::pin(std::future::pending())
        }

        fn begin_drain<'a>(&'a self, _instance: &'a str) -> BoxFuture<'a, FleetResult<()>> {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test]
    async fn scale_up_is_acknowledged_then_completed() {
        let farm = farm("[[queues]]\nname = \"cpu\"\n");
        farm.set_depth("cpu", 40, 10);

        let report = farm.reconciler.tick().await;
        let Some(QueueOutcome::Issued(intent)) = report.outcome("cpu") else {
            panic!("expected a scale-up");
        };
        assert_eq!(intent.direction, ScaleDirection::Up);
        assert_eq!(intent.delta, 5);
        assert!(farm.reconciler.readiness().is_ready(farm.clock.now()));

        farm.reconciler.settle().await;
        let outstanding = farm.reconciler.tracker().outstanding("cpu").await.unwrap();
        assert_eq!(outstanding.status, IntentStatus::Acknowledged);
        assert_eq!(outstanding.operations.len(), 1);
        assert_eq!(farm.fleet.list("cpu").await.unwrap().len(), 5);

        farm.advance(5);
        let report = farm.reconciler.tick().await;
        assert!(matches!(report.outcome("cpu"), Some(QueueOutcome::Completed(_))));
        assert_eq!(farm.reconciler.tracker().phase("cpu").await, Some(QueuePhase::Idle));

        let events = farm.reconciler.events();
        assert_eq!(events.count(EventKind::IntentIssued).await, 1);
        assert_eq!(events.count(EventKind::IntentAcknowledged).await, 1);
        assert_eq!(events.count(EventKind::IntentCompleted).await, 1);
    }

    #[tokio::test]
    async fn failed_actuation_returns_queue_to_idle() {
        let config = config("[[queues]]\nname = \"cpu\"\n");
        let failing = Arc::new(FailingActuator::default());
        let farm = farm_with(&config, &["cpu"], Some(failing.clone()));
        farm.set_depth("cpu", 30, 0);

        let report = farm.reconciler.tick().await;
        assert!(matches!(report.outcome("cpu"), Some(QueueOutcome::Issued(_))));
        farm.reconciler.settle().await;

        assert_eq!(failing.calls.load(Ordering::SeqCst), 2);
        assert_eq!(farm.reconciler.tracker().phase("cpu").await, Some(QueuePhase::Idle));
        assert_eq!(farm.reconciler.events().count(EventKind::IntentFailed).await, 1);

        // Eligible again on the next tick.
        farm.advance(5);
        let report = farm.reconciler.tick().await;
        assert!(matches!(report.outcome("cpu"), Some(QueueOutcome::Issued(_))));
    }

    #[tokio::test]
    async fn scale_down_drains_oldest_then_terminates() {
        let farm = farm("[[queues]]\nname = \"cpu\"\n[queues.scaling]\nmin_replicas = 1\n");
        let ids = farm.ready_workers("cpu", 3, 0).await;
        farm.set_depth("cpu", 0, 0);

        let report = farm.reconciler.tick().await;
        let Some(QueueOutcome::Issued(intent)) = report.outcome("cpu") else {
            panic!("expected a scale-down");
        };
        assert_eq!(intent.direction, ScaleDirection::Down);
        assert_eq!(intent.targets, ids[..2].to_vec());
        assert_eq!(intent.expected_count, 1);

        farm.reconciler.settle().await;
        for id in &ids[..2] {
            assert_eq!(farm.fleet.observe(id).await.unwrap(), Some(WorkerState::Terminated));
        }
        assert_eq!(farm.fleet.observe(&ids[2]).await.unwrap(), Some(WorkerState::Ready));

        let events = farm.reconciler.events();
        assert_eq!(events.count(EventKind::DrainStarted).await, 1);
        assert_eq!(events.count(EventKind::DrainForced).await, 0);
        assert_eq!(events.count(EventKind::WorkerTerminated).await, 1);

        farm.advance(5);
        let report = farm.reconciler.tick().await;
        assert!(matches!(report.outcome("cpu"), Some(QueueOutcome::Completed(_))));
    }

    #[tokio::test]
    async fn busy_workers_are_force_drained_after_grace() {
        let farm = farm("[[queues]]\nname = \"cpu\"\n");
        let ids = farm.ready_workers("cpu", 1, 3).await;
        farm.set_depth("cpu", 0, 0);
        let report = farm.reconciler.tick().await;
        assert!(matches!(report.outcome("cpu"), Some(QueueOutcome::Issued(_))));
        farm.reconciler.settle().await;

        let events = farm.reconciler.events();
        assert_eq!(events.count(EventKind::DrainForced).await, 1);
        let forced = events
            .recent(10)
            .await
            .into_iter()
            .find(|e| e.kind == EventKind::DrainForced)
            .unwrap();
        assert_eq!(forced.instances, ids);
        assert_eq!(farm.fleet.observe(&ids[0]).await.unwrap(), Some(WorkerState::Terminated));
    }

    #[tokio::test]
    async fn acknowledged_intent_expires_when_inventory_never_catches_up() {
        let farm = farm("[[queues]]\nname = \"cpu\"\n");
        farm.set_depth("cpu", 20, 0);

        farm.reconciler.tick().await;
        farm.reconciler.settle().await;
        for w in farm.fleet.list("cpu").await.unwrap() {
            farm.fleet.terminate(&w.id).await.unwrap();
        }

        farm.advance(5);
        let report = farm.reconciler.tick().await;
        assert_eq!(report.outcome("cpu"), Some(&QueueOutcome::Busy(QueuePhase::ScalingUp)));

        farm.advance(30);
        let report = farm.reconciler.tick().await;
        let Some(QueueOutcome::Expired(intent)) = report.outcome("cpu") else {
            panic!("expected expiry");
        };
        assert_eq!(intent.status, IntentStatus::Expired);
        assert_eq!(farm.reconciler.events().count(EventKind::IntentExpired).await, 1);
        assert_eq!(farm.reconciler.tracker().phase("cpu").await, Some(QueuePhase::Idle));
    }

    #[tokio::test]
    async fn probe_failure_is_isolated_to_its_queue() {
        let config = config("[[queues]]\nname = \"cpu\"\n\n[[queues]]\nname = \"gpu\"\n");
        let farm = farm_with(&config, &["cpu"], None);
        farm.set_depth("cpu", 10, 0);

        let report = farm.reconciler.tick().await;
        assert!(matches!(report.outcome("gpu"), Some(QueueOutcome::ProbeFailed(_))));
        assert!(matches!(report.outcome("cpu"), Some(QueueOutcome::Issued(_))));
    }

    #[tokio::test]
    async fn slower_queue_is_evaluated_on_its_own_interval() {
        let farm = farm(
            "[[queues]]\nname = \"cpu\"\n\n[[queues]]\nname = \"gpu\"\n[queues.scaling]\ntick_interval_secs = 20\n",
        );
        assert_eq!(farm.reconciler.tick_interval(), Duration::from_secs(5));

        farm.reconciler.tick().await;
        farm.advance(5);
        let report = farm.reconciler.tick().await;
        assert!(matches!(report.outcome("cpu"), Some(QueueOutcome::Held(_))));
        assert_eq!(report.outcome("gpu"), Some(&QueueOutcome::NotDue));

        farm.advance(15);
        let report = farm.reconciler.tick().await;
        assert!(matches!(report.outcome("gpu"), Some(QueueOutcome::Held(_))));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let farm = farm("[[queues]]\nname = \"cpu\"\n");
        let (tx, rx) = watch::channel(false);
        let reconciler = farm.reconciler.clone();
        let handle = tokio::spawn(async move { reconciler.run(rx).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(farm.reconciler.readiness().ticks() >= 1);
    }

    #[tokio::test]
    async fn restart_mid_drain_reclaims_the_draining_worker() {
        let config = config(
            "[[queues]]\nname = \"cpu\"\n[queues.scaling]\nmax_replicas = 2\ndrain_grace_secs = 30\n",
        );
        let farm = farm_with(&config, &["cpu"], None);
        let ids = farm.ready_workers("cpu", 2, 3).await;
        farm.set_depth("cpu", 10, 0);

        let report = farm.reconciler.tick().await;
        let Some(QueueOutcome::Issued(intent)) = report.outcome("cpu") else {
            panic!("expected a scale-down");
        };
        assert_eq!(intent.targets, vec![ids[0].clone()]);
        while farm.fleet.observe(&ids[0]).await.unwrap() != Some(WorkerState::Draining) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        // The process dies while the victim is still busy draining.
        farm.reconciler.abort_actuations().await;

        let restarted = farm.restart(&config);
        farm.set_depth("cpu", 100, 0);
        let report = restarted.tick().await;
        assert_eq!(report.outcome("cpu"), Some(&QueueOutcome::Held(Hold::AtCapacity)));
        assert_eq!(farm.fleet.observe(&ids[0]).await.unwrap(), Some(WorkerState::Draining));

        farm.advance(30);
        farm.set_depth("cpu", 100, 0);
        let report = restarted.tick().await;
        let Some(QueueOutcome::Issued(up)) = report.outcome("cpu") else {
            panic!("expected a scale-up once the draining worker was reclaimed");
        };
        assert_eq!(up.direction, ScaleDirection::Up);
        assert_eq!(up.delta, 1);
        assert_eq!(farm.fleet.observe(&ids[0]).await.unwrap(), Some(WorkerState::Terminated));

        let events = restarted.events();
        assert_eq!(events.count(EventKind::DrainForced).await, 1);
        assert_eq!(events.count(EventKind::WorkerTerminated).await, 1);
        restarted.settle().await;
    }

    #[tokio::test]
    async fn idle_abandoned_drain_is_terminated_at_once() {
        let config = config("[[queues]]\nname = \"cpu\"\n[queues.scaling]\ndrain_grace_secs = 600\n");
        let farm = farm_with(&config, &["cpu"], None);
        let ids = farm.ready_workers("cpu", 2, 0).await;
        farm.fleet.begin_drain(&ids[0]).await.unwrap();
        farm.set_depth("cpu", 10, 0);

        let report = farm.reconciler.tick().await;
        assert_eq!(report.outcome("cpu"), Some(&QueueOutcome::Held(Hold::Balanced)));
        assert_eq!(farm.fleet.observe(&ids[0]).await.unwrap(), Some(WorkerState::Terminated));
        assert_eq!(farm.reconciler.events().count(EventKind::DrainForced).await, 0);
        assert_eq!(farm.reconciler.events().count(EventKind::WorkerTerminated).await, 1);
    }

    #[tokio::test]
    async fn stranded_workers_are_retired_and_replaced() {
        let mut config = config("[[queues]]\nname = \"cpu\"\n[queues.scaling]\nmax_replicas = 2\n");
        config.controller.retire_after_secs = 120;
        let farm = farm_with(&config, &["cpu"], None);
        farm.fleet.provision("cpu", 2).await.unwrap();
        farm.set_depth("cpu", 100, 0);

        // Two workers that never heartbeat hold the whole replica budget.
        let report = farm.reconciler.tick().await;
        assert_eq!(report.outcome("cpu"), Some(&QueueOutcome::Held(Hold::AtCapacity)));

        farm.advance(121);
        farm.set_depth("cpu", 100, 0);
        let report = farm.reconciler.tick().await;
        let Some(QueueOutcome::Issued(intent)) = report.outcome("cpu") else {
            panic!("expected replacements for the stranded workers");
        };
        assert_eq!(intent.delta, 2);

        let retired = farm
            .reconciler
            .events()
            .recent(10)
            .await
            .into_iter()
            .find(|e| e.kind == EventKind::WorkerRetired)
            .unwrap();
        assert_eq!(retired.instances.len(), 2);
        for id in &retired.instances {
            assert_eq!(farm.fleet.observe(id).await.unwrap(), Some(WorkerState::Terminated));
        }
        farm.reconciler.settle().await;
    }

    #[tokio::test]
    async fn hung_actuation_expires_and_frees_the_queue() {
        let mut config = config("[[queues]]\nname = \"cpu\"\n");
        config.controller.actuation.call_timeout_ms = 60_000;
        let farm = farm_with(&config, &["cpu"], Some(Arc::new(HangingActuator)));
        farm.set_depth("cpu", 30, 0);

        let report = farm.reconciler.tick().await;
        let Some(QueueOutcome::Issued(intent)) = report.outcome("cpu") else {
            panic!("expected a scale-up");
        };
        let deadline = actuation_deadline(intent, &config.controller, 0);

        farm.advance(5);
        let report = farm.reconciler.tick().await;
        assert_eq!(report.outcome("cpu"), Some(&QueueOutcome::Busy(QueuePhase::ScalingUp)));

        farm.clock.set(deadline);
        let report = farm.reconciler.tick().await;
        let Some(QueueOutcome::Expired(expired)) = report.outcome("cpu") else {
            panic!("expected the hung intent to expire");
        };
        assert_eq!(expired.status, IntentStatus::Expired);
        // The hung task was aborted, so there is nothing left to wait for.
        farm.reconciler.settle().await;
        assert_eq!(farm.reconciler.tracker().phase("cpu").await, Some(QueuePhase::Idle));
        assert_eq!(farm.reconciler.events().count(EventKind::IntentExpired).await, 1);

        farm.advance(5);
        farm.set_depth("cpu", 30, 0);
        let report = farm.reconciler.tick().await;
        assert!(matches!(report.outcome("cpu"), Some(QueueOutcome::Issued(_))));
        farm.reconciler.abort_actuations().await;
    }

    #[tokio::test]
    async fn actuator_call_timeouts_fail_the_intent() {
        let mut config = config("[[queues]]\nname = \"cpu\"\n");
        config.controller.actuation.call_timeout_ms = 20;
        let farm = farm_with(&config, &["cpu"], Some(Arc::new(HangingActuator)));
        farm.set_depth("cpu", 30, 0);

        let report = farm.reconciler.tick().await;
        assert!(matches!(report.outcome("cpu"), Some(QueueOutcome::Issued(_))));
        farm.reconciler.settle().await;

        assert_eq!(farm.reconciler.tracker().phase("cpu").await, Some(QueuePhase::Idle));
        let failed = farm
            .reconciler
            .events()
            .recent(10)
            .await
            .into_iter()
            .find(|e| e.kind == EventKind::IntentFailed)
            .unwrap();
        assert!(failed.detail.unwrap().contains("timed out"));
    }

    #[test]
    fn scale_down_deadline_covers_grace_and_every_call() {
        let mut controller = ControllerConfig::default();
        controller.actuation = ActuationConfig {
            max_attempts: 2,
            backoff_max_ms: 1_000,
            call_timeout_ms: 4_000,
            ack_timeout_secs: 30,
            ..ActuationConfig::default()
        };
        let up = ScaleIntent::up("cpu", 3, 0, 1_000);
        assert_eq!(actuation_deadline(&up, &controller, 60), 1_000 + 30 + 2 * 10);

        let down = ScaleIntent::down("cpu", vec!["a".into(), "b".into()], 4, 1_000);
        assert_eq!(actuation_deadline(&down, &controller, 60), 1_000 + 30 + 60 + 6 * 10);
    }
}
