//! Readiness of the control loop.

use std::sync::atomic::{AtomicU64, Ordering};

/// Ready while ticks keep completing: the last one finished within three
/// tick intervals.
#[derive(Debug)]
pub struct Readiness {
    tick_interval_secs: u64,
    /// 0 until the first tick completes.
    last_tick_at: AtomicU64,
    ticks: AtomicU64,
}

impl Readiness {
    pub fn new(tick_interval_secs: u64) -> Self {
        Self {
            tick_interval_secs,
            last_tick_at: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
        }
    }

    pub fn mark_tick(&self, now: u64) {
        self.last_tick_at.store(now.max(1), Ordering::Release);
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_tick_at(&self) -> Option<u64> {
        match self.last_tick_at.load(Ordering::Acquire) {
            0 => None,
            at => Some(at),
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn is_ready(&self, now: u64) -> bool {
        self.last_tick_at()
            .is_some_and(|at| now.saturating_sub(at) <= self.tick_interval_secs.saturating_mul(3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_before_first_tick() {
        let readiness = Readiness::new(15);
        assert!(!readiness.is_ready(1000));
        assert_eq!(readiness.last_tick_at(), None);
    }

    #[test]
    fn ready_until_three_intervals_pass() {
        let readiness = Readiness::new(15);
        readiness.mark_tick(1000);
        assert!(readiness.is_ready(1000));
        assert!(readiness.is_ready(1045));
        assert!(!readiness.is_ready(1046));
        assert_eq!(readiness.ticks(), 1);
    }
}
