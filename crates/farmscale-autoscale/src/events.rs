//! Audit trail of scaling activity.
//!
//! Every event is logged under the `farmscale::audit` tracing target and
//! kept in a bounded in-memory buffer for the HTTP API.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use farmscale_state::{InstanceId, ScaleDirection, ScaleIntent};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const AUDIT_TARGET: &str = "farmscale::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    IntentIssued,
    IntentAcknowledged,
    IntentCompleted,
    IntentFailed,
    IntentExpired,
    DrainStarted,
    /// Workers were terminated with work still in flight after the grace period.
    DrainForced,
    WorkerTerminated,
    /// Workers terminated for never becoming usable capacity.
    WorkerRetired,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::IntentIssued => "intent_issued",
            EventKind::IntentAcknowledged => "intent_acknowledged",
            EventKind::IntentCompleted => "intent_completed",
            EventKind::IntentFailed => "intent_failed",
            EventKind::IntentExpired => "intent_expired",
            EventKind::DrainStarted => "drain_started",
            EventKind::DrainForced => "drain_forced",
            EventKind::WorkerTerminated => "worker_terminated",
            EventKind::WorkerRetired => "worker_retired",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScaleEvent {
    pub at: u64,
    pub queue: String,
    pub kind: EventKind,
    pub direction: Option<ScaleDirection>,
    pub delta: u32,
    pub instances: Vec<InstanceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ScaleEvent {
    /// An event about `intent` as a whole.
    pub fn for_intent(kind: EventKind, intent: &ScaleIntent, at: u64) -> Self {
        Self {
            at,
            queue: intent.queue.clone(),
            kind,
            direction: Some(intent.direction),
            delta: intent.delta,
            instances: intent.targets.clone(),
            detail: None,
        }
    }

    /// An event about specific workers of a queue.
    pub fn for_workers(kind: EventKind, queue: &str, instances: Vec<InstanceId>, at: u64) -> Self {
        Self {
            at,
            queue: queue.to_string(),
            kind,
            direction: None,
            delta: instances.len() as u32,
            instances,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

struct Buffer {
    events: VecDeque<ScaleEvent>,
    counts: BTreeMap<EventKind, u64>,
}

/// Bounded log of recent events plus running totals per kind.
pub struct EventLog {
    capacity: usize,
    buffer: Mutex<Buffer>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffer: Mutex::new(Buffer {
                events: VecDeque::new(),
                counts: BTreeMap::new(),
            }),
        }
    }

    pub async fn record(&self, event: ScaleEvent) {
        let direction = event.direction.map(|d| d.to_string()).unwrap_or_default();
        let detail = event.detail.as_deref().unwrap_or("");
        match event.kind {
            EventKind::IntentFailed
            | EventKind::IntentExpired
            | EventKind::DrainForced
            | EventKind::WorkerRetired => warn!(
                target: AUDIT_TARGET,
                queue = %event.queue,
                kind = %event.kind,
                %direction,
                delta = event.delta,
                instances = ?event.instances,
                %detail,
                "scale event"
            ),
            _ => info!(
                target: AUDIT_TARGET,
                queue = %event.queue,
                kind = %event.kind,
                %direction,
                delta = event.delta,
                instances = ?event.instances,
                %detail,
                "scale event"
            ),
        }

        let mut buffer = self.buffer.lock().await;
        *buffer.counts.entry(event.kind).or_insert(0) += 1;
        if buffer.events.len() == self.capacity {
            buffer.events.pop_front();
        }
        buffer.events.push_back(event);
    }

    /// Up to `limit` most recent events, oldest first.
    pub async fn recent(&self, limit: usize) -> Vec<ScaleEvent> {
        let buffer = self.buffer.lock().await;
        let skip = buffer.events.len().saturating_sub(limit);
        buffer.events.iter().skip(skip).cloned().collect()
    }

    /// Events recorded since start, by kind.
    pub async fn counts(&self) -> Vec<(EventKind, u64)> {
        let buffer = self.buffer.lock().await;
        buffer.counts.iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub async fn count(&self, kind: EventKind) -> u64 {
        let buffer = self.buffer.lock().await;
        buffer.counts.get(&kind).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffer_keeps_latest_and_counts_all() {
        let log = EventLog::new(2);
        for i in 0..3 {
            log.record(ScaleEvent::for_workers(EventKind::WorkerTerminated, "cpu", vec![format!("w{i}")], i))
                .await;
        }
        log.record(ScaleEvent::for_workers(EventKind::DrainForced, "cpu", vec!["w9".into()], 9).with_detail("grace elapsed"))
            .await;

        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].instances, vec!["w2".to_string()]);
        assert_eq!(recent[1].kind, EventKind::DrainForced);
        assert_eq!(recent[1].detail.as_deref(), Some("grace elapsed"));

        assert_eq!(log.count(EventKind::WorkerTerminated).await, 3);
        assert_eq!(
            log.counts().await,
            vec![(EventKind::DrainForced, 1), (EventKind::WorkerTerminated, 3)]
        );
    }

    #[tokio::test]
    async fn intent_events_carry_direction_and_targets() {
        let intent = ScaleIntent::down("cpu", vec!["w1".into()], 3, 50);
        let event = ScaleEvent::for_intent(EventKind::IntentIssued, &intent, 50);
        assert_eq!(event.direction, Some(ScaleDirection::Down));
        assert_eq!(event.delta, 1);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "intent_issued");
        assert_eq!(json["direction"], "down");
        assert!(json.get("detail").is_none());
    }

    #[tokio::test]
    async fn recent_limits_from_the_newest() {
        let log = EventLog::new(10);
        for i in 0..5 {
            log.record(ScaleEvent::for_workers(EventKind::DrainStarted, "cpu", Vec::new(), i)).await;
        }
        let recent = log.recent(2).await;
        assert_eq!(recent.iter().map(|e| e.at).collect::<Vec<_>>(), vec![3, 4]);
    }
}
