//! Probe that scrapes the farm server's Prometheus endpoint.
//!
//! The server exports its backlog as gauges (`queue_size` for pending
//! operations by default); each worker exports its own slot usage, which
//! is how in-progress work is scoped to a single instance while draining.

use std::collections::HashMap;
use std::time::Duration;

use farmscale_core::{BoxFuture, QueueSettings, ResourceRange, SandboxBackendConfig};
use farmscale_state::QueueDepth;
use tracing::debug;

use crate::error::{ProbeError, ProbeResult};
use crate::probe::{BackplaneProbe, QueueReading};
use crate::scrape::{MetricValues, fetch_text};

/// Scrapes queue depth from the server and per-worker load from each worker.
pub struct MetricsBackplane {
    server_url: String,
    pending_metric: String,
    in_progress_metric: String,
    slot_usage_metric: String,
    queue_label: String,
    worker_metrics_port: u16,
    timeout: Duration,
    /// Queue properties come from configuration; the metrics page has none.
    properties: HashMap<String, Vec<ResourceRange>>,
}

impl MetricsBackplane {
    pub fn new(config: &SandboxBackendConfig, queues: &[QueueSettings]) -> Self {
        Self {
            server_url: config.server_metrics_url.clone(),
            pending_metric: config.pending_metric.clone(),
            in_progress_metric: config.in_progress_metric.clone(),
            slot_usage_metric: config.slot_usage_metric.clone(),
            queue_label: config.queue_label.clone(),
            worker_metrics_port: config.worker_metrics_port,
            timeout: Duration::from_millis(config.scrape_timeout_ms),
            properties: queues
                .iter()
                .map(|q| (q.name.clone(), q.properties.clone()))
                .collect(),
        }
    }

    /// Turn a scraped server page into a reading for `queue`.
    fn reading_from(&self, values: &MetricValues, queue: &str) -> ProbeResult<QueueReading> {
        let properties = self
            .properties
            .get(queue)
            .cloned()
            .ok_or_else(|| ProbeError::UnknownQueue(queue.to_string()))?;
        if !values.contains(&self.pending_metric) {
            return Err(ProbeError::Malformed(format!(
                "metric {} missing",
                self.pending_metric
            )));
        }
        let pending = values.sum_scoped(&self.pending_metric, &self.queue_label, queue);
        let in_progress = values.sum_scoped(&self.in_progress_metric, &self.queue_label, queue);
        Ok(QueueReading {
            depth: QueueDepth::new(as_count(pending), as_count(in_progress)),
            properties,
        })
    }
}

impl BackplaneProbe for MetricsBackplane {
    fn read<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, ProbeResult<QueueReading>> {
        Box::pin(async move {
            let text = fetch_text(&self.server_url, self.timeout).await?;
            let values = MetricValues::parse(&text);
            let reading = self.reading_from(&values, queue)?;
            debug!(
                %queue,
                pending = reading.depth.pending,
                in_progress = reading.depth.in_progress,
                "scraped queue depth"
            );
            Ok(reading)
        })
    }

    fn instance_in_progress<'a>(
        &'a self,
        _queue: &'a str,
        instance: &'a str,
    ) -> BoxFuture<'a, ProbeResult<Option<u64>>> {
        Box::pin(async move {
            let url = format!("http://{instance}:{}/metrics", self.worker_metrics_port);
            let text = fetch_text(&url, self.timeout).await?;
            let values = MetricValues::parse(&text);
            if !values.contains(&self.slot_usage_metric) {
                return Ok(None);
            }
            Ok(Some(as_count(values.sum(&self.slot_usage_metric))))
        })
    }
}

fn as_count(value: f64) -> u64 {
    if value <= 0.0 { 0 } else { value.round() as u64 }
}
