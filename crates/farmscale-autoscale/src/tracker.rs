//! Per-queue phase tracking.
//!
//! Every queue is Idle, ScalingUp or ScalingDown. Phase changes go through
//! [`transition`], a pure function of the current phase and an event. The
//! [`IntentTracker`] holds all queues behind one lock so that checking for
//! Idle, running the policy and issuing an intent happen atomically.

use std::collections::HashMap;
use std::fmt;

use farmscale_core::ScalingSettings;
use farmscale_state::{FleetSnapshot, IntentStatus, ScaleDirection, ScaleIntent};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::policy::{self, Decision, DecisionHistory, Hold};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePhase {
    Idle,
    ScalingUp,
    ScalingDown,
}

impl fmt::Display for QueuePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueuePhase::Idle => f.write_str("idle"),
            QueuePhase::ScalingUp => f.write_str("scaling_up"),
            QueuePhase::ScalingDown => f.write_str("scaling_down"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    IntentIssued(ScaleDirection),
    IntentResolved,
}

impl fmt::Display for PhaseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseEvent::IntentIssued(direction) => write!(f, "intent issued ({direction})"),
            PhaseEvent::IntentResolved => f.write_str("intent resolved"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("queue is {phase}: cannot apply {event}")]
    Invalid { phase: QueuePhase, event: PhaseEvent },

    #[error("unknown queue: {0}")]
    UnknownQueue(String),
}

/// The queue state machine.
pub fn transition(phase: QueuePhase, event: PhaseEvent) -> Result<QueuePhase, TransitionError> {
    match (phase, event) {
        (QueuePhase::Idle, PhaseEvent::IntentIssued(ScaleDirection::Up)) => Ok(QueuePhase::ScalingUp),
        (QueuePhase::Idle, PhaseEvent::IntentIssued(ScaleDirection::Down)) => {
            Ok(QueuePhase::ScalingDown)
        }
        (QueuePhase::ScalingUp | QueuePhase::ScalingDown, PhaseEvent::IntentResolved) => {
            Ok(QueuePhase::Idle)
        }
        (phase, event) => Err(TransitionError::Invalid { phase, event }),
    }
}

/// Result of offering a queue for evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// An intent is outstanding; the queue was not evaluated.
    Busy(QueuePhase),
    /// The queue's own tick interval has not elapsed.
    NotDue,
    Held(Hold),
    /// A new intent was issued and the queue left Idle.
    Issued(ScaleIntent),
}

struct QueueSlot {
    phase: QueuePhase,
    intent: Option<ScaleIntent>,
    history: DecisionHistory,
    last_evaluated: Option<u64>,
    last_snapshot: Option<FleetSnapshot>,
    last_hold: Option<Hold>,
}

/// A queue's phase and most recent observation, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct QueueView {
    pub queue: String,
    pub phase: QueuePhase,
    pub intent: Option<ScaleIntent>,
    pub last_evaluated: Option<u64>,
    pub last_hold: Option<String>,
    pub snapshot: Option<FleetSnapshot>,
}

/// All queue slots behind one lock.
pub struct IntentTracker {
    slots: Mutex<HashMap<String, QueueSlot>>,
}

impl IntentTracker {
    pub fn new<'a>(queues: impl IntoIterator<Item = &'a str>, trend_window: usize) -> Self {
        let slots = queues
            .into_iter()
            .map(|name| {
                let slot = QueueSlot {
                    phase: QueuePhase::Idle,
                    intent: None,
                    history: DecisionHistory::new(trend_window),
                    last_evaluated: None,
                    last_snapshot: None,
                    last_hold: None,
                };
                (name.to_string(), slot)
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Evaluate `snapshot` if the queue is Idle and due, issuing an intent
    /// when the policy asks for one. Runs under a single lock acquisition.
    pub async fn try_begin(
        &self,
        snapshot: FleetSnapshot,
        settings: &ScalingSettings,
        now: u64,
    ) -> Result<Evaluation, TransitionError> {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .get_mut(&snapshot.queue)
            .ok_or_else(|| TransitionError::UnknownQueue(snapshot.queue.clone()))?;

        if slot.phase != QueuePhase::Idle {
            slot.last_snapshot = Some(snapshot);
            return Ok(Evaluation::Busy(slot.phase));
        }
        if let Some(last) = slot.last_evaluated
            && now.saturating_sub(last) < settings.tick_interval_secs
        {
            return Ok(Evaluation::NotDue);
        }

        slot.last_evaluated = Some(now);
        slot.history.observe(snapshot.depth.total());
        let decision = policy::evaluate(&snapshot, settings, &slot.history, now);
        let current = snapshot.non_terminated_count();
        let queue = snapshot.queue.clone();
        slot.last_snapshot = Some(snapshot);

        let intent = match decision {
            Decision::Hold(hold) => {
                slot.last_hold = Some(hold);
                return Ok(Evaluation::Held(hold));
            }
            Decision::ScaleUp { delta, .. } => ScaleIntent::up(&queue, delta, current, now),
            Decision::ScaleDown { victims, .. } => ScaleIntent::down(&queue, victims, current, now),
        };

        slot.phase = transition(slot.phase, PhaseEvent::IntentIssued(intent.direction))?;
        slot.history.record(intent.direction, now);
        slot.last_hold = None;
        slot.intent = Some(intent.clone());
        Ok(Evaluation::Issued(intent))
    }

    /// Whether an Idle queue's own tick interval has elapsed.
    pub async fn is_due(&self, queue: &str, interval_secs: u64, now: u64) -> bool {
        let slots = self.slots.lock().await;
        slots
            .get(queue)
            .and_then(|s| s.last_evaluated)
            .is_none_or(|last| now.saturating_sub(last) >= interval_secs)
    }

    /// The outstanding intent for a queue, if any.
    pub async fn outstanding(&self, queue: &str) -> Option<ScaleIntent> {
        let slots = self.slots.lock().await;
        slots.get(queue).and_then(|s| s.intent.clone())
    }

    /// Apply `f` to the outstanding intent issued at `issued_at`. Returns
    /// false if that intent is no longer outstanding.
    pub async fn update(
        &self,
        queue: &str,
        issued_at: u64,
        f: impl FnOnce(&mut ScaleIntent),
    ) -> bool {
        let mut slots = self.slots.lock().await;
        match slots
            .get_mut(queue)
            .and_then(|s| s.intent.as_mut())
            .filter(|i| i.issued_at == issued_at)
        {
            Some(intent) => {
                f(intent);
                true
            }
            None => false,
        }
    }

    /// Close the outstanding intent issued at `issued_at` with `status`
    /// and return the queue to Idle. Returns the closed intent, or `None`
    /// if it had already been resolved.
    pub async fn resolve(
        &self,
        queue: &str,
        issued_at: u64,
        status: IntentStatus,
    ) -> Result<Option<ScaleIntent>, TransitionError> {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .get_mut(queue)
            .ok_or_else(|| TransitionError::UnknownQueue(queue.to_string()))?;

        if slot.intent.as_ref().is_none_or(|i| i.issued_at != issued_at) {
            return Ok(None);
        }
        slot.phase = transition(slot.phase, PhaseEvent::IntentResolved)?;
        Ok(slot.intent.take().map(|mut intent| {
            intent.status = status;
            intent
        }))
    }

    pub async fn phase(&self, queue: &str) -> Option<QueuePhase> {
        let slots = self.slots.lock().await;
        slots.get(queue).map(|s| s.phase)
    }

    /// Every queue, sorted by name.
    pub async fn views(&self) -> Vec<QueueView> {
        let slots = self.slots.lock().await;
        let mut views: Vec<QueueView> = slots
            .iter()
            .map(|(name, slot)| QueueView {
                queue: name.clone(),
                phase: slot.phase,
                intent: slot.intent.clone(),
                last_evaluated: slot.last_evaluated,
                last_hold: slot.last_hold.map(|h| h.to_string()),
                snapshot: slot.last_snapshot.clone(),
            })
            .collect();
        views.sort_by(|a, b| a.queue.cmp(&b.queue));
        views
    }
}
