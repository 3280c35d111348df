//! Run-wide metric counters.
//!
//! Per-check statistics live on the run state (`CheckStats`); this module
//! holds the cross-cutting counters surfaced to telemetry: active checks,
//! fail_if triggers by scope, issues by severity, and per-provider duration
//! histograms.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::domain::models::issue::Severity;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    active_checks: AtomicI64,
    issues_critical: AtomicU64,
    issues_error: AtomicU64,
    issues_warning: AtomicU64,
    issues_info: AtomicU64,
    fail_if_by_scope: Mutex<HashMap<String, u64>>,
    provider_durations_ms: Mutex<HashMap<String, Vec<u64>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_started(&self) {
        self.active_checks.fetch_add(1, Ordering::SeqCst);
    }

    pub fn check_finished(&self) {
        self.active_checks.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active_checks(&self) -> i64 {
        self.active_checks.load(Ordering::SeqCst)
    }

    pub fn record_issue(&self, severity: Severity) {
        let counter = match severity {
            Severity::Critical => &self.issues_critical,
            Severity::Error => &self.issues_error,
            Severity::Warning => &self.issues_warning,
            Severity::Info => &self.issues_info,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_fail_if(&self, scope: &str) {
        let mut map = self.fail_if_by_scope.lock().expect("metrics poisoned");
        *map.entry(scope.to_string()).or_insert(0) += 1;
    }

    pub fn record_provider_duration(&self, provider: &str, duration_ms: u64) {
        let mut map = self.provider_durations_ms.lock().expect("metrics poisoned");
        map.entry(provider.to_string()).or_default().push(duration_ms);
    }

    /// Snapshot for `state.snapshot` telemetry events.
    pub fn snapshot(&self) -> Value {
        let fail_if = self.fail_if_by_scope.lock().expect("metrics poisoned").clone();
        let durations = self
            .provider_durations_ms
            .lock()
            .expect("metrics poisoned")
            .iter()
            .map(|(provider, samples)| {
                let total: u64 = samples.iter().sum();
                let count = samples.len() as u64;
                let max = samples.iter().copied().max().unwrap_or(0);
                (
                    provider.clone(),
                    json!({ "count": count, "total_ms": total, "max_ms": max }),
                )
            })
            .collect::<serde_json::Map<_, _>>();
        json!({
            "active_checks": self.active_checks(),
            "issues": {
                "critical": self.issues_critical.load(Ordering::SeqCst),
                "error": self.issues_error.load(Ordering::SeqCst),
                "warning": self.issues_warning.load(Ordering::SeqCst),
                "info": self.issues_info.load(Ordering::SeqCst),
            },
            "fail_if_by_scope": fail_if,
            "provider_durations": Value::Object(durations),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_gauge_tracks_start_finish() {
        let metrics = MetricsRegistry::new();
        metrics.check_started();
        metrics.check_started();
        metrics.check_finished();
        assert_eq!(metrics.active_checks(), 1);
    }

    #[test]
    fn snapshot_reports_counters() {
        let metrics = MetricsRegistry::new();
        metrics.record_issue(Severity::Error);
        metrics.record_issue(Severity::Error);
        metrics.record_issue(Severity::Info);
        metrics.record_fail_if("<root>");
        metrics.record_provider_duration("command", 12);
        metrics.record_provider_duration("command", 30);

        let snap = metrics.snapshot();
        assert_eq!(snap["issues"]["error"], 2);
        assert_eq!(snap["issues"]["info"], 1);
        assert_eq!(snap["fail_if_by_scope"]["<root>"], 1);
        assert_eq!(snap["provider_durations"]["command"]["count"], 2);
        assert_eq!(snap["provider_durations"]["command"]["max_ms"], 30);
    }
}
