//! Prometheus-compatible metrics for the Nexus API.
//!
//! Counters are bumped by the handlers; gauges are read from the broker at
//! scrape time.

use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Point-in-time broker state rendered as gauges.
#[derive(Debug, Clone, Default)]
pub struct Gauges {
    pub providers: usize,
    pub cached_records: usize,
    pub pending_approvals: usize,
    pub tracked_actions: usize,
    pub audit_head_seq: u64,
    pub audit_halted: bool,
}

#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    http_requests_total: AtomicU64,
    /// 4xx and 5xx.
    http_errors_total: AtomicU64,
    context_requests_total: AtomicU64,
    context_partial_total: AtomicU64,
    context_records_served_total: AtomicU64,
    context_pushes_total: AtomicU64,
    actions_submitted_total: AtomicU64,
    actions_auto_approved_total: AtomicU64,
    actions_blocked_total: AtomicU64,
    approvals_requested_total: AtomicU64,
    approvals_resolved_total: AtomicU64,
    rollbacks_requested_total: AtomicU64,
    started_at: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                http_requests_total: AtomicU64::new(0),
                http_errors_total: AtomicU64::new(0),
                context_requests_total: AtomicU64::new(0),
                context_partial_total: AtomicU64::new(0),
                context_records_served_total: AtomicU64::new(0),
                context_pushes_total: AtomicU64::new(0),
                actions_submitted_total: AtomicU64::new(0),
                actions_auto_approved_total: AtomicU64::new(0),
                actions_blocked_total: AtomicU64::new(0),
                approvals_requested_total: AtomicU64::new(0),
                approvals_resolved_total: AtomicU64::new(0),
                rollbacks_requested_total: AtomicU64::new(0),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn inc_http_requests(&self) {
        self.inner.http_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_http_errors(&self) {
        self.inner.http_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// One gather call and what it returned.
    pub fn record_gather(&self, records: usize, partial: bool) {
        let m = &self.inner;
        m.context_requests_total.fetch_add(1, Ordering::Relaxed);
        m.context_records_served_total
            .fetch_add(records as u64, Ordering::Relaxed);
        if partial {
            m.context_partial_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_context_pushes(&self) {
        self.inner.context_pushes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_actions_submitted(&self) {
        self.inner
            .actions_submitted_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_actions_auto_approved(&self) {
        self.inner
            .actions_auto_approved_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_actions_blocked(&self) {
        self.inner.actions_blocked_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_approvals_requested(&self) {
        self.inner
            .approvals_requested_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_approvals_resolved(&self) {
        self.inner
            .approvals_resolved_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rollbacks_requested(&self) {
        self.inner
            .rollbacks_requested_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn http_requests(&self) -> u64 {
        self.inner.http_requests_total.load(Ordering::Relaxed)
    }

    pub fn http_errors(&self) -> u64 {
        self.inner.http_errors_total.load(Ordering::Relaxed)
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render_prometheus(&self, gauges: &Gauges) -> String {
        let m = &self.inner;
        let counters: [(&str, &str, u64); 12] = [
            ("http_requests_total", "Total HTTP requests served.", load(&m.http_requests_total)),
            ("http_errors_total", "Total HTTP errors (4xx/5xx).", load(&m.http_errors_total)),
            ("context_requests_total", "Context gather requests.", load(&m.context_requests_total)),
            ("context_partial_total", "Gathers that returned partial results.", load(&m.context_partial_total)),
            ("context_records_served_total", "Context records returned to consumers.", load(&m.context_records_served_total)),
            ("context_pushes_total", "Context records pushed by providers.", load(&m.context_pushes_total)),
            ("actions_submitted_total", "Proposed actions received.", load(&m.actions_submitted_total)),
            ("actions_auto_approved_total", "Actions executed without human sign-off.", load(&m.actions_auto_approved_total)),
            ("actions_blocked_total", "Actions blocked by the safety validator.", load(&m.actions_blocked_total)),
            ("approvals_requested_total", "Actions parked for human approval.", load(&m.approvals_requested_total)),
            ("approvals_resolved_total", "Approvals resolved by a human.", load(&m.approvals_resolved_total)),
            ("rollbacks_requested_total", "Manual rollbacks requested.", load(&m.rollbacks_requested_total)),
        ];
        let gauge_rows: [(&str, &str, u64); 7] = [
            ("uptime_seconds", "Time since the server started.", m.started_at.elapsed().as_secs()),
            ("providers", "Registered context providers.", gauges.providers as u64),
            ("cached_records", "Pushed context records in cache.", gauges.cached_records as u64),
            ("pending_approvals", "Actions awaiting approval.", gauges.pending_approvals as u64),
            ("tracked_actions", "Actions tracked by the engine.", gauges.tracked_actions as u64),
            ("audit_head_seq", "Sequence number of the last audit entry.", gauges.audit_head_seq),
            ("audit_halted", "1 when the audit log has halted on an integrity failure.", u64::from(gauges.audit_halted)),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP nexus_{name} {help}\n# TYPE nexus_{name} counter\nnexus_{name} {value}\n");
        }
        for (name, help, value) in gauge_rows {
            let _ = writeln!(out, "# HELP nexus_{name} {help}\n# TYPE nexus_{name} gauge\nnexus_{name} {value}\n");
        }
        out
    }
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let metrics = Metrics::new();
        metrics.inc_http_requests();
        metrics.inc_http_requests();
        metrics.record_gather(3, true);
        metrics.record_gather(2, false);

        let body = metrics.render_prometheus(&Gauges::default());
        assert!(body.contains("nexus_http_requests_total 2"));
        assert!(body.contains("nexus_context_requests_total 2"));
        assert!(body.contains("nexus_context_partial_total 1"));
        assert!(body.contains("nexus_context_records_served_total 5"));
        assert!(body.contains("# TYPE nexus_actions_blocked_total counter"));
    }

    #[test]
    fn test_gauges_render() {
        let metrics = Metrics::new();
        let body = metrics.render_prometheus(&Gauges {
            providers: 4,
            pending_approvals: 1,
            audit_head_seq: 17,
            audit_halted: true,
            ..Default::default()
        });
        assert!(body.contains("nexus_providers 4"));
        assert!(body.contains("nexus_pending_approvals 1"));
        assert!(body.contains("nexus_audit_head_seq 17"));
        assert!(body.contains("nexus_audit_halted 1"));
        assert!(body.contains("# TYPE nexus_uptime_seconds gauge"));
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = Metrics::new();
        let clone = metrics.clone();
        clone.inc_http_errors();
        assert_eq!(metrics.http_errors(), 1);
    }
}
