//! Prometheus text exposition format.

use std::fmt::Write;

use farmscale_autoscale::{EventKind, QueuePhase, QueueView};

/// Render queue state, worker counts and audit event totals.
///
/// Queue series carry a `queue` label; event totals carry `kind`.
pub fn render_prometheus(
    views: &[QueueView],
    events: &[(EventKind, u64)],
    probe_failures: &[(String, u32)],
) -> String {
    let mut out = String::new();

    out.push_str("# HELP farmscale_queue_depth Actions in the queue by kind.\n");
    out.push_str("# TYPE farmscale_queue_depth gauge\n");
    for v in views {
        if let Some(s) = &v.snapshot {
            let _ = writeln!(
                out,
                "farmscale_queue_depth{{queue=\"{}\",kind=\"pending\"}} {}",
                v.queue, s.depth.pending
            );
            let _ = writeln!(
                out,
                "farmscale_queue_depth{{queue=\"{}\",kind=\"in_progress\"}} {}",
                v.queue, s.depth.in_progress
            );
        }
    }

    out.push_str("# HELP farmscale_queue_sample_stale Whether the last depth sample was stale.\n");
    out.push_str("# TYPE farmscale_queue_sample_stale gauge\n");
    for v in views {
        if let Some(s) = &v.snapshot {
            let _ = writeln!(
                out,
                "farmscale_queue_sample_stale{{queue=\"{}\"}} {}",
                v.queue,
                u8::from(s.stale)
            );
        }
    }

    out.push_str("# HELP farmscale_workers Workers by lifecycle state; ready counts serving workers only.\n");
    out.push_str("# TYPE farmscale_workers gauge\n");
    for v in views {
        if let Some(s) = &v.snapshot {
            let counts = [
                ("ready", s.ready_count()),
                ("provisioning", s.provisioning_count()),
                ("draining", s.draining_count()),
                ("non_terminated", s.non_terminated_count()),
            ];
            for (state, count) in counts {
                let _ = writeln!(
                    out,
                    "farmscale_workers{{queue=\"{}\",state=\"{state}\"}} {count}",
                    v.queue
                );
            }
        }
    }

    out.push_str("# HELP farmscale_queue_phase Current phase per queue (1 for the active phase).\n");
    out.push_str("# TYPE farmscale_queue_phase gauge\n");
    for v in views {
        for phase in [QueuePhase::Idle, QueuePhase::ScalingUp, QueuePhase::ScalingDown] {
            let _ = writeln!(
                out,
                "farmscale_queue_phase{{queue=\"{}\",phase=\"{phase}\"}} {}",
                v.queue,
                u8::from(v.phase == phase)
            );
        }
    }

    out.push_str("# HELP farmscale_probe_consecutive_failures Backplane read failures in a row.\n");
    out.push_str("# TYPE farmscale_probe_consecutive_failures gauge\n");
    for (queue, failures) in probe_failures {
        let _ = writeln!(
            out,
            "farmscale_probe_consecutive_failures{{queue=\"{queue}\"}} {failures}"
        );
    }

    out.push_str("# HELP farmscale_events_total Scaling audit events since start.\n");
    out.push_str("# TYPE farmscale_events_total counter\n");
    for (kind, count) in events {
        let _ = writeln!(out, "farmscale_events_total{{kind=\"{kind}\"}} {count}");
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmscale_state::{FleetSnapshot, QueueDepth, WorkerInstance, WorkerState};

    fn view(queue: &str) -> QueueView {
        let workers = vec![
            WorkerInstance {
                state: WorkerState::Ready,
                last_heartbeat: Some(1000),
                ..WorkerInstance::new("w1", queue, 900)
            },
            WorkerInstance::new("w2", queue, 950),
        ];
        QueueView {
            queue: queue.to_string(),
            phase: QueuePhase::ScalingUp,
            intent: None,
            last_evaluated: Some(1000),
            last_hold: None,
            snapshot: Some(FleetSnapshot::new(
                queue,
                QueueDepth::new(42, 7),
                1000,
                false,
                workers,
                1000,
                60,
            )),
        }
    }

    #[test]
    fn render_empty() {
        let output = render_prometheus(&[], &[], &[]);
        assert!(output.contains("# HELP farmscale_queue_depth"));
        assert!(output.contains("# TYPE farmscale_events_total counter"));
    }

    #[test]
    fn render_single_queue() {
        let output = render_prometheus(
            &[view("cpu")],
            &[(EventKind::IntentIssued, 3)],
            &[("cpu".to_string(), 2)],
        );

        assert!(output.contains("farmscale_queue_depth{queue=\"cpu\",kind=\"pending\"} 42"));
        assert!(output.contains("farmscale_queue_depth{queue=\"cpu\",kind=\"in_progress\"} 7"));
        assert!(output.contains("farmscale_workers{queue=\"cpu\",state=\"ready\"} 1"));
        assert!(output.contains("farmscale_workers{queue=\"cpu\",state=\"provisioning\"} 1"));
        assert!(output.contains("farmscale_queue_phase{queue=\"cpu\",phase=\"scaling_up\"} 1"));
        assert!(output.contains("farmscale_queue_phase{queue=\"cpu\",phase=\"idle\"} 0"));
        assert!(output.contains("farmscale_queue_sample_stale{queue=\"cpu\"} 0"));
        assert!(output.contains("farmscale_probe_consecutive_failures{queue=\"cpu\"} 2"));
        assert!(output.contains("farmscale_events_total{kind=\"intent_issued\"} 3"));
    }

    #[test]
    fn render_format_is_prometheus_compatible() {
        let output = render_prometheus(&[view("cpu"), view("gpu")], &[(EventKind::IntentFailed, 1)], &[]);
        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            assert!(
                line.contains('{') && line.contains('}'),
                "line should have labels: {line}"
            );
        }
    }
}
