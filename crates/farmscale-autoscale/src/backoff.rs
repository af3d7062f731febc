//! Bounded exponential backoff for actuator calls.

use std::future::Future;
use std::time::Duration;

use farmscale_core::ActuationConfig;
use farmscale_fleet::{FleetError, FleetResult};
use tracing::{debug, warn};

/// Counts failed attempts and hands out the delay before the next one.
#[derive(Debug)]
pub struct Backoff {
    attempts: u32,
    max_attempts: u32,
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(config: &ActuationConfig) -> Self {
        Self {
            attempts: 0,
            max_attempts: config.max_attempts.max(1),
            current: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Record a failed attempt. Returns the delay before retrying, or
    /// `None` once `max_attempts` attempts have failed.
    pub fn fail(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            return None;
        }
        let delay = self.current.min(self.max);
        self.current = (self.current * 2).min(self.max);
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Await one fleet call, giving up after `call_timeout_ms`.
pub async fn bounded<T>(
    config: &ActuationConfig,
    action: &str,
    call: impl Future<Output = FleetResult<T>>,
) -> FleetResult<T> {
    let limit = Duration::from_millis(config.call_timeout_ms);
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| FleetError::Timeout(format!("{action} after {}ms", config.call_timeout_ms)))?
}

/// Run `op` until it succeeds or the attempt budget runs out; the last
/// error is returned. An attempt that outlives the call timeout counts
/// as failed.
pub async fn with_retry<T, F, Fut>(
    config: &ActuationConfig,
    action: &str,
    target: &str,
    mut op: F,
) -> FleetResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = FleetResult<T>>,
{
    let mut backoff = Backoff::new(config);
    loop {
        match bounded(config, action, op()).await {
            Ok(value) => {
                if backoff.attempts() > 0 {
                    debug!(%action, %target, attempts = backoff.attempts() + 1, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => match backoff.fail() {
                Some(delay) => {
                    warn!(
                        %action,
                        %target,
                        attempt = backoff.attempts(),
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "actuation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(
                        %action,
                        %target,
                        attempts = backoff.attempts(),
                        error = %e,
                        "actuation failed, giving up"
                    );
                    return Err(e);
                }
            },
        }
    }
}
