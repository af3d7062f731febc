//! Domain types shared by the controller and the farm store.
//!
//! Timestamps are unix seconds. Nothing in here reads the clock; callers
//! pass `now` in so decisions can be replayed deterministically.

use std::fmt;

use farmscale_core::ResourceRange;
use serde::{Deserialize, Serialize};

/// Name of a queue (a class of build actions).
pub type QueueName = String;

/// Unique identifier for a worker instance, across all queues.
pub type InstanceId = String;

/// Identifier returned by the actuator for each scale operation.
pub type OperationId = String;

// ── Queue ─────────────────────────────────────────────────────────

/// Backlog counters for a queue as reported by the backplane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub pending: u64,
    pub in_progress: u64,
}

impl QueueDepth {
    pub fn new(pending: u64, in_progress: u64) -> Self {
        Self {
            pending,
            in_progress,
        }
    }

    /// The backlog signal the policy scales on.
    pub fn total(&self) -> u64 {
        self.pending.saturating_add(self.in_progress)
    }
}

/// A queue definition plus its last observed counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub name: QueueName,
    pub properties: Vec<ResourceRange>,
    pub depth: QueueDepth,
    /// Unix timestamp of the last depth update.
    pub updated_at: u64,
}

// ── Worker ────────────────────────────────────────────────────────

/// Lifecycle of a worker instance. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Provisioning,
    Ready,
    Draining,
    Terminated,
}

impl WorkerState {
    /// Forward moves (including skips) are allowed; staying put is a no-op.
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        next >= self
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Provisioning => "provisioning",
            WorkerState::Ready => "ready",
            WorkerState::Draining => "draining",
            WorkerState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One worker instance. Belongs to exactly one queue for its lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInstance {
    pub id: InstanceId,
    pub queue: QueueName,
    pub state: WorkerState,
    pub created_at: u64,
    pub last_heartbeat: Option<u64>,
    /// Set when the worker enters Draining.
    #[serde(default)]
    pub drain_started_at: Option<u64>,
    pub terminated_at: Option<u64>,
}

impl WorkerInstance {
    pub fn new(id: &str, queue: &str, created_at: u64) -> Self {
        Self {
            id: id.to_string(),
            queue: queue.to_string(),
            state: WorkerState::Provisioning,
            created_at,
            last_heartbeat: None,
            drain_started_at: None,
            terminated_at: None,
        }
    }

    /// Whether the worker has been heard from within `timeout_secs`.
    /// A worker that never sent a heartbeat is measured from its creation.
    pub fn heartbeat_fresh(&self, now: u64, timeout_secs: u64) -> bool {
        let last_seen = self.last_heartbeat.unwrap_or(self.created_at);
        now.saturating_sub(last_seen) <= timeout_secs
    }

    /// Ready and heartbeating: the only state that counts as usable capacity.
    pub fn is_serving(&self, now: u64, timeout_secs: u64) -> bool {
        self.state == WorkerState::Ready && self.heartbeat_fresh(now, timeout_secs)
    }

    /// Stuck in Provisioning, or Ready but silent, for longer than
    /// `retire_after_secs`. Such a worker holds capacity it will never serve.
    pub fn is_stranded(&self, now: u64, retire_after_secs: u64) -> bool {
        match self.state {
            WorkerState::Provisioning | WorkerState::Ready => {
                !self.heartbeat_fresh(now, retire_after_secs)
            }
            WorkerState::Draining | WorkerState::Terminated => false,
        }
    }

    /// Whether a draining worker has been draining for at least `grace_secs`.
    /// Workers without a recorded drain start are measured from creation.
    pub fn drain_expired(&self, now: u64, grace_secs: u64) -> bool {
        let started = self.drain_started_at.unwrap_or(self.created_at);
        self.state == WorkerState::Draining && now.saturating_sub(started) >= grace_secs
    }
}

// ── Scale intents ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
}

impl fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleDirection::Up => f.write_str("up"),
            ScaleDirection::Down => f.write_str("down"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    Acknowledged,
    Failed,
    Expired,
}

impl IntentStatus {
    /// Pending and Acknowledged intents block new ones for the same queue.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, IntentStatus::Pending | IntentStatus::Acknowledged)
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Acknowledged => "acknowledged",
            IntentStatus::Failed => "failed",
            IntentStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// A single outstanding request to change a queue's replica count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleIntent {
    pub queue: QueueName,
    pub direction: ScaleDirection,
    pub delta: u32,
    pub issued_at: u64,
    pub status: IntentStatus,
    /// Actuator operations spawned for this intent.
    pub operations: Vec<OperationId>,
    /// Instances selected for removal (scale-down only).
    pub targets: Vec<InstanceId>,
    /// Non-terminated worker count expected once the intent lands.
    pub expected_count: u32,
}

impl ScaleIntent {
    pub fn up(queue: &str, delta: u32, current: u32, now: u64) -> Self {
        Self {
            queue: queue.to_string(),
            direction: ScaleDirection::Up,
            delta,
            issued_at: now,
            status: IntentStatus::Pending,
            operations: Vec::new(),
            targets: Vec::new(),
            expected_count: current.saturating_add(delta),
        }
    }

    pub fn down(queue: &str, targets: Vec<InstanceId>, current: u32, now: u64) -> Self {
        let delta = targets.len() as u32;
        Self {
            queue: queue.to_string(),
            direction: ScaleDirection::Down,
            delta,
            issued_at: now,
            status: IntentStatus::Pending,
            operations: Vec::new(),
            targets,
            expected_count: current.saturating_sub(delta),
        }
    }
}

// ── Actuator operations ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Acknowledged,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationKind {
    Provision { queue: QueueName, count: u32 },
    Terminate { instance: InstanceId },
}

/// An actuator operation as recorded by the local fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: OperationId,
    pub kind: OperationKind,
    pub status: OperationStatus,
    /// Workers created by a provision operation.
    pub instances: Vec<InstanceId>,
    pub created_at: u64,
}

// ── Snapshot ──────────────────────────────────────────────────────

/// Immutable view of one queue's counts and its workers at `taken_at`.
/// This is the unit the scaling policy decides on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub queue: QueueName,
    pub depth: QueueDepth,
    /// The depth came from a last-known-good fallback or is too old.
    pub stale: bool,
    /// When the depth was read from the backplane.
    pub sampled_at: u64,
    pub taken_at: u64,
    pub heartbeat_timeout_secs: u64,
    /// Workers ordered oldest first.
    pub workers: Vec<WorkerInstance>,
}

impl FleetSnapshot {
    pub fn new(
        queue: &str,
        depth: QueueDepth,
        sampled_at: u64,
        stale: bool,
        mut workers: Vec<WorkerInstance>,
        taken_at: u64,
        heartbeat_timeout_secs: u64,
    ) -> Self {
        workers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Self {
            queue: queue.to_string(),
            depth,
            stale,
            sampled_at,
            taken_at,
            heartbeat_timeout_secs,
            workers,
        }
    }

    /// Ready workers with a fresh heartbeat, oldest first.
    pub fn serving(&self) -> impl Iterator<Item = &WorkerInstance> {
        self.workers
            .iter()
            .filter(|w| w.is_serving(self.taken_at, self.heartbeat_timeout_secs))
    }

    pub fn ready_count(&self) -> u32 {
        self.serving().count() as u32
    }

    pub fn provisioning_count(&self) -> u32 {
        self.count_in(WorkerState::Provisioning)
    }

    pub fn draining_count(&self) -> u32 {
        self.count_in(WorkerState::Draining)
    }

    /// Everything not yet terminated counts against `max_replicas`,
    /// including Ready workers whose heartbeat went quiet.
    pub fn non_terminated_count(&self) -> u32 {
        self.workers
            .iter()
            .filter(|w| w.state != WorkerState::Terminated)
            .count() as u32
    }

    /// Seconds between the backplane read and this snapshot.
    pub fn sample_age(&self) -> u64 {
        self.taken_at.saturating_sub(self.sampled_at)
    }

    fn count_in(&self, state: WorkerState) -> u32 {
        self.workers.iter().filter(|w| w.state == state).count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: &str, state: WorkerState, created_at: u64, heartbeat: Option<u64>) -> WorkerInstance {
        WorkerInstance {
            state,
            last_heartbeat: heartbeat,
            ..WorkerInstance::new(id, "cpu", created_at)
        }
    }

    #[test]
    fn lifecycle_only_moves_forward() {
        use WorkerState::*;
        assert!(Provisioning.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Draining));
        assert!(Provisioning.can_transition_to(Terminated));
        assert!(Draining.can_transition_to(Draining));
        assert!(!Ready.can_transition_to(Provisioning));
        assert!(!Terminated.can_transition_to(Ready));
        assert!(!Draining.can_transition_to(Ready));
    }

    #[test]
    fn depth_total_saturates() {
        assert_eq!(QueueDepth::new(3, 4).total(), 7);
        assert_eq!(QueueDepth::new(u64::MAX, 1).total(), u64::MAX);
    }

    #[test]
    fn snapshot_counts_and_orders_workers() {
        let snap = FleetSnapshot::new(
            "cpu",
            QueueDepth::new(10, 2),
            995,
            false,
            vec![
                worker("w-3", WorkerState::Ready, 300, Some(990)),
                worker("w-1", WorkerState::Ready, 100, Some(990)),
                worker("w-2", WorkerState::Ready, 200, Some(100)), // quiet
                worker("w-4", WorkerState::Provisioning, 400, None),
                worker("w-5", WorkerState::Draining, 50, Some(990)),
                worker("w-6", WorkerState::Terminated, 10, Some(10)),
            ],
            1000,
            60,
        );

        assert_eq!(snap.ready_count(), 2);
        assert_eq!(snap.provisioning_count(), 1);
        assert_eq!(snap.draining_count(), 1);
        assert_eq!(snap.non_terminated_count(), 5);
        assert_eq!(snap.sample_age(), 5);

        let serving: Vec<&str> = snap.serving().map(|w| w.id.as_str()).collect();
        assert_eq!(serving, vec!["w-1", "w-3"]);
        assert_eq!(snap.workers[0].id, "w-6");
    }

    #[test]
    fn missing_heartbeat_measured_from_creation() {
        let w = worker("w-1", WorkerState::Ready, 1000, None);
        assert!(w.heartbeat_fresh(1030, 60));
        assert!(!w.heartbeat_fresh(1061, 60));
    }

    #[test]
    fn stuck_and_silent_workers_are_stranded() {
        let booting = worker("w-1", WorkerState::Provisioning, 1000, None);
        assert!(!booting.is_stranded(1600, 600));
        assert!(booting.is_stranded(1601, 600));

        let quiet = worker("w-2", WorkerState::Ready, 0, Some(1000));
        assert!(!quiet.is_stranded(1500, 600));
        assert!(quiet.is_stranded(1700, 600));

        let draining = worker("w-3", WorkerState::Draining, 0, None);
        assert!(!draining.is_stranded(10_000, 600));
    }

    #[test]
    fn drain_grace_counts_from_drain_start() {
        let mut w = worker("w-1", WorkerState::Draining, 100, Some(900));
        w.drain_started_at = Some(1000);
        assert!(!w.drain_expired(1029, 30));
        assert!(w.drain_expired(1030, 30));

        // Records written before drain start was tracked fall back to creation.
        w.drain_started_at = None;
        assert!(w.drain_expired(1000, 30));

        let ready = worker("w-2", WorkerState::Ready, 0, Some(900));
        assert!(!ready.drain_expired(10_000, 30));
    }

    #[test]
    fn worker_records_without_drain_start_still_decode() {
        let json = r#"{"id":"w-1","queue":"cpu","state":"ready","created_at":5,"last_heartbeat":null,"terminated_at":null}"#;
        let w: WorkerInstance = serde_json::from_str(json).unwrap();
        assert_eq!(w.drain_started_at, None);
    }

    #[test]
    fn intent_constructors_compute_expected_count() {
        let up = ScaleIntent::up("cpu", 3, 2, 1000);
        assert_eq!(up.expected_count, 5);
        assert_eq!(up.status, IntentStatus::Pending);
        assert!(up.status.is_outstanding());

        let down = ScaleIntent::down("cpu", vec!["a".into(), "b".into()], 5, 1000);
        assert_eq!(down.delta, 2);
        assert_eq!(down.expected_count, 3);
        assert!(!IntentStatus::Failed.is_outstanding());
    }
}
