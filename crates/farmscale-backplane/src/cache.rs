//! Last-known-good sample cache.
//!
//! Wraps a probe so a failed read returns the previous good sample marked
//! as coming from the cache. A cached sample older than the staleness
//! threshold is flagged `stale`; the reconciler refuses to scale up on it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ProbeResult;
use crate::probe::{BackplaneProbe, QueueSample};

#[derive(Default)]
struct CacheEntry {
    last_good: Option<QueueSample>,
    consecutive_failures: u32,
}

/// A probe with per-queue last-known-good fallback.
pub struct CachedProbe {
    inner: Arc<dyn BackplaneProbe>,
    staleness_threshold_secs: u64,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl CachedProbe {
    pub fn new(inner: Arc<dyn BackplaneProbe>, staleness_threshold_secs: u64) -> Self {
        Self {
            inner,
            staleness_threshold_secs,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Sample a queue at `now`. Only fails when the read fails and no
    /// good sample has ever been seen for the queue.
    pub async fn sample(&self, queue: &str, now: u64) -> ProbeResult<QueueSample> {
        let result = self.inner.read(queue).await;
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(queue.to_string()).or_default();

        match result {
            Ok(reading) => {
                if entry.consecutive_failures > 0 {
                    info!(
                        %queue,
                        failures = entry.consecutive_failures,
                        "backplane reads recovered"
                    );
                }
                entry.consecutive_failures = 0;
                let sample = QueueSample {
                    queue: queue.to_string(),
                    depth: reading.depth,
                    properties: reading.properties,
                    sampled_at: now,
                    from_cache: false,
                    stale: false,
                };
                entry.last_good = Some(sample.clone());
                Ok(sample)
            }
            Err(e) => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures == 1 {
                    warn!(%queue, error = %e, "backplane read failed");
                } else {
                    debug!(
                        %queue,
                        error = %e,
                        failures = entry.consecutive_failures,
                        "backplane read still failing"
                    );
                }

                match &entry.last_good {
                    Some(good) => {
                        let age = now.saturating_sub(good.sampled_at);
                        Ok(QueueSample {
                            from_cache: true,
                            stale: age > self.staleness_threshold_secs,
                            ..good.clone()
                        })
                    }
                    None => Err(e),
                }
            }
        }
    }

    /// Per-instance in-progress count; errors degrade to "unknown".
    pub async fn instance_in_progress(&self, queue: &str, instance: &str) -> Option<u64> {
        match self.inner.instance_in_progress(queue, instance).await {
            Ok(count) => count,
            Err(e) => {
                debug!(%queue, %instance, error = %e, "instance load read failed");
                None
            }
        }
    }

    /// Consecutive read failures for a queue.
    pub async fn consecutive_failures(&self, queue: &str) -> u32 {
        let entries = self.entries.lock().await;
        entries
            .get(queue)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
    }
}
