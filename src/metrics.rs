//! Flow-control metrics — lightweight counters without external dependencies

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Metrics snapshot — a point-in-time view of admission outcomes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Requests presented to the chain
    pub total_requests: u64,
    /// Requests admitted by every controller
    pub admitted: u64,
    /// Requests denied after exhausting their wait budget
    pub timed_out: u64,
    /// Requests denied by a rate controller
    pub rate_limited: u64,
    /// Denials per controller name
    pub controller_rejections: HashMap<String, u64>,
}

/// Admission metrics collector
pub struct FlowMetrics {
    total_requests: AtomicU64,
    admitted: AtomicU64,
    timed_out: AtomicU64,
    rate_limited: AtomicU64,
    controller_rejections: RwLock<HashMap<String, u64>>,
}

impl FlowMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            controller_rejections: RwLock::new(HashMap::new()),
        }
    }

    /// Record a request entering the chain
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fully admitted request
    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an admission timeout at the named controller
    pub fn record_timeout(&self, controller: &str) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
        self.record_rejection(controller);
    }

    /// Record a rate-limit denial at the named controller
    pub fn record_rate_limited(&self, controller: &str) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
        self.record_rejection(controller);
    }

    fn record_rejection(&self, controller: &str) {
        let mut rejections = self.controller_rejections.write().unwrap();
        *rejections.entry(controller.to_string()).or_insert(0) += 1;
    }

    /// Take a point-in-time snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            controller_rejections: self.controller_rejections.read().unwrap().clone(),
        }
    }
}

impl Default for FlowMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_snapshot_is_zero() {
        let metrics = FlowMetrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.admitted, 0);
        assert_eq!(snapshot.timed_out, 0);
        assert_eq!(snapshot.rate_limited, 0);
        assert!(snapshot.controller_rejections.is_empty());
    }

    #[test]
    fn test_counters_accumulate() {
        let metrics = FlowMetrics::new();
        metrics.record_request();
        metrics.record_request();
        metrics.record_admitted();
        metrics.record_timeout("global");
        metrics.record_rate_limited("rate");
        metrics.record_timeout("global");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.admitted, 1);
        assert_eq!(snapshot.timed_out, 2);
        assert_eq!(snapshot.rate_limited, 1);
        assert_eq!(snapshot.controller_rejections["global"], 2);
        assert_eq!(snapshot.controller_rejections["rate"], 1);
    }

    #[test]
    fn test_snapshot_serialization() {
        let metrics = FlowMetrics::new();
        metrics.record_request();
        metrics.record_admitted();
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        let parsed: MetricsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.total_requests, 1);
        assert_eq!(parsed.admitted, 1);
    }
}
