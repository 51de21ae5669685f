//! Router Metrics
//!
//! Counters shared by the router and the proxy pool. Constructed once at
//! startup and handed to the components that bump them.

use std::sync::atomic::{AtomicU64, Ordering};

/// Routing counters, exported in Prometheus text format.
#[derive(Debug, Default)]
pub struct RouterMetrics {
    site: String,
    requests: AtomicU64,
    local_hits: AtomicU64,
    table_hits: AtomicU64,
    forwards: AtomicU64,
    answered: AtomicU64,
    failed: AtomicU64,
    /// Times every proxy was down and one was picked at random.
    broken_healthcheck: AtomicU64,
    healthcheck_failures: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub local_hits: u64,
    pub table_hits: u64,
    pub forwards: u64,
    pub answered: u64,
    pub failed: u64,
    pub broken_healthcheck: u64,
    pub healthcheck_failures: u64,
}

impl RouterMetrics {
    pub fn new(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            ..Default::default()
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_local_hit(&self) {
        self.local_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_table_hit(&self) {
        self.table_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forward(&self) {
        self.forwards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_answered(&self) {
        self.answered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_broken_healthcheck(&self) {
        self.broken_healthcheck.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_healthcheck_failure(&self) {
        self.healthcheck_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            local_hits: self.local_hits.load(Ordering::Relaxed),
            table_hits: self.table_hits.load(Ordering::Relaxed),
            forwards: self.forwards.load(Ordering::Relaxed),
            answered: self.answered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            broken_healthcheck: self.broken_healthcheck.load(Ordering::Relaxed),
            healthcheck_failures: self.healthcheck_failures.load(Ordering::Relaxed),
        }
    }

    /// Export all counters in Prometheus text format.
    pub fn export_prometheus(&self) -> String {
        let snap = self.snapshot();
        let counters: [(&str, &str, u64); 8] = [
            ("edgedns_requests_total", "Queries received", snap.requests),
            ("edgedns_local_hits_total", "Queries answered with this site", snap.local_hits),
            ("edgedns_table_hits_total", "Queries answered from the service table", snap.table_hits),
            ("edgedns_forwards_total", "Queries forwarded upstream", snap.forwards),
            ("edgedns_answered_total", "Queries answered successfully", snap.answered),
            ("edgedns_failed_total", "Queries answered with a failure code", snap.failed),
            (
                "edgedns_broken_healthcheck_total",
                "Forwards made while every upstream was down",
                snap.broken_healthcheck,
            ),
            (
                "edgedns_healthcheck_failures_total",
                "Failed upstream health checks",
                snap.healthcheck_failures,
            ),
        ];

        let mut output = String::new();
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{}{{site=\"{}\"}} {}\n", name, self.site, value));
        }
        output
    }
}
