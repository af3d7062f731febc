//! Scaling policy: pure decisions from a fleet snapshot.
//!
//! Nothing here reads a clock or touches I/O. The caller supplies `now`
//! and keeps the [`DecisionHistory`] between ticks.

use std::collections::VecDeque;
use std::fmt;

use farmscale_core::ScalingSettings;
use farmscale_state::{FleetSnapshot, InstanceId, ScaleDirection};

/// What the policy wants done for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Add `delta` workers.
    ScaleUp { delta: u32, desired: u32 },
    /// Drain and remove these workers, oldest first.
    ScaleDown { victims: Vec<InstanceId>, desired: u32 },
    /// Leave the queue alone.
    Hold(Hold),
}

/// Why no scaling happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hold {
    /// Capacity already matches demand.
    Balanced,
    /// More workers are wanted but the depth sample is stale.
    StaleSample,
    /// More workers are wanted but the last scale-up was too recent.
    UpCooldown { remaining_secs: u64 },
    /// More workers are wanted but the queue is at `max_replicas`.
    AtCapacity,
    /// Fewer workers would do but the last scale-down was too recent.
    DownCooldown { remaining_secs: u64 },
    /// Not enough depth samples yet to judge the trend.
    TrendFilling { have: usize, need: usize },
    /// Depth is still rising.
    TrendRising,
}

impl fmt::Display for Hold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hold::Balanced => f.write_str("balanced"),
            Hold::StaleSample => f.write_str("stale depth sample"),
            Hold::UpCooldown { remaining_secs } => {
                write!(f, "scale-up cooldown ({remaining_secs}s left)")
            }
            Hold::AtCapacity => f.write_str("at max replicas"),
            Hold::DownCooldown { remaining_secs } => {
                write!(f, "scale-down cooldown ({remaining_secs}s left)")
            }
            Hold::TrendFilling { have, need } => {
                write!(f, "trend window filling ({have}/{need})")
            }
            Hold::TrendRising => f.write_str("depth rising"),
        }
    }
}

/// Shape of the recent depth samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Filling,
    Rising,
    /// Flat or falling.
    Steady,
}

/// Per-queue memory the policy decides against: the last scale times and
/// a bounded window of recent depths.
#[derive(Debug, Clone)]
pub struct DecisionHistory {
    window: usize,
    depths: VecDeque<u64>,
    last_scale_up: Option<u64>,
    last_scale_down: Option<u64>,
}

impl DecisionHistory {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            depths: VecDeque::with_capacity(window),
            last_scale_up: None,
            last_scale_down: None,
        }
    }

    /// Push a depth sample, dropping the oldest once the window is full.
    pub fn observe(&mut self, depth: u64) {
        if self.depths.len() == self.window {
            self.depths.pop_front();
        }
        self.depths.push_back(depth);
    }

    /// Note that an intent in `direction` was issued at `now`.
    pub fn record(&mut self, direction: ScaleDirection, now: u64) {
        match direction {
            ScaleDirection::Up => self.last_scale_up = Some(now),
            ScaleDirection::Down => self.last_scale_down = Some(now),
        }
    }

    pub fn trend(&self) -> Trend {
        if self.depths.len() < self.window {
            return Trend::Filling;
        }
        let rising = self
            .depths
            .iter()
            .zip(self.depths.iter().skip(1))
            .any(|(prev, next)| next > prev);
        if rising { Trend::Rising } else { Trend::Steady }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn depths(&self) -> impl Iterator<Item = &u64> {
        self.depths.iter()
    }

    pub fn last_scale_up(&self) -> Option<u64> {
        self.last_scale_up
    }

    pub fn last_scale_down(&self) -> Option<u64> {
        self.last_scale_down
    }
}

/// Workers needed for `depth`, within the queue's replica bounds.
pub fn desired_replicas(depth: u64, settings: &ScalingSettings) -> u32 {
    let per_worker = u64::from(settings.target_actions_per_worker.max(1));
    let needed = u32::try_from(depth.div_ceil(per_worker)).unwrap_or(u32::MAX);
    needed.max(settings.min_replicas).min(settings.max_replicas)
}

/// Serving capacity plus partially-counted capacity still coming up.
pub fn effective_capacity(snapshot: &FleetSnapshot, settings: &ScalingSettings) -> f64 {
    f64::from(snapshot.ready_count())
        + f64::from(snapshot.provisioning_count()) * settings.provisioning_weight
}

/// Decide what to do for one queue. Scale-up is considered first.
pub fn evaluate(
    snapshot: &FleetSnapshot,
    settings: &ScalingSettings,
    history: &DecisionHistory,
    now: u64,
) -> Decision {
    let desired = desired_replicas(snapshot.depth.total(), settings);
    let effective = effective_capacity(snapshot, settings);
    let ready = snapshot.ready_count();

    if f64::from(desired) > effective {
        if snapshot.stale {
            return Decision::Hold(Hold::StaleSample);
        }
        if let Some(remaining_secs) =
            cooldown_remaining(history.last_scale_up, settings.scale_up_cooldown_secs, now)
        {
            return Decision::Hold(Hold::UpCooldown { remaining_secs });
        }
        let gap = (f64::from(desired) - effective).ceil() as u32;
        let headroom = settings
            .max_replicas
            .saturating_sub(snapshot.non_terminated_count());
        let delta = gap.min(headroom);
        if delta == 0 {
            return Decision::Hold(Hold::AtCapacity);
        }
        return Decision::ScaleUp { delta, desired };
    }

    if desired < ready {
        if let Some(remaining_secs) = cooldown_remaining(
            history.last_scale_down,
            settings.scale_down_cooldown_secs,
            now,
        ) {
            return Decision::Hold(Hold::DownCooldown { remaining_secs });
        }
        match history.trend() {
            Trend::Filling => {
                return Decision::Hold(Hold::TrendFilling {
                    have: history.depths.len(),
                    need: history.window,
                });
            }
            Trend::Rising => return Decision::Hold(Hold::TrendRising),
            Trend::Steady => {}
        }

        let mut count = ready - desired.max(settings.min_replicas);
        if snapshot.stale {
            count = count.min(1);
        }
        let victims: Vec<InstanceId> = snapshot
            .serving()
            .take(count as usize)
            .map(|w| w.id.clone())
            .collect();
        if victims.is_empty() {
            return Decision::Hold(Hold::Balanced);
        }
        return Decision::ScaleDown { victims, desired };
    }

    Decision::Hold(Hold::Balanced)
}

/// Seconds left on a cooldown, or `None` once it has elapsed.
fn cooldown_remaining(last: Option<u64>, cooldown_secs: u64, now: u64) -> Option<u64> {
    let last = last?;
    let elapsed = now.saturating_sub(last);
    (elapsed < cooldown_secs).then(|| cooldown_secs - elapsed)
}
