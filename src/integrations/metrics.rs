// Metrics sink - per-call request metrics and integration ok/fail counters

use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// One outbound HTTP attempt
#[derive(Debug, Clone, Serialize)]
pub struct ExternalRequestInfo {
    pub external_system: String,
    pub method: String,
    pub url: String,
    pub trace_id: String,
    /// `None` when the attempt failed before a response arrived
    pub response_code: Option<u16>,
    pub duration: Duration,
}

/// Where metrics go; the exporter itself lives outside the runtime
pub trait MetricsSink: Send + Sync {
    fn request(&self, info: ExternalRequestInfo);

    /// Called exactly once per integration block run
    fn integration_result(&self, system: &str, ok: bool);
}

/// Sink that only logs, used when no exporter is configured
#[derive(Debug, Default, Clone)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn request(&self, info: ExternalRequestInfo) {
        debug!(
            system = %info.external_system,
            method = %info.method,
            url = %info.url,
            trace_id = %info.trace_id,
            code = ?info.response_code,
            duration_ms = info.duration.as_millis() as u64,
            "external request"
        );
    }

    fn integration_result(&self, system: &str, ok: bool) {
        if ok {
            debug!(system, "integration push ok");
        } else {
            warn!(system, "integration push failed");
        }
    }
}

/// Sink that keeps everything in memory; backs `/metrics` snapshots and tests
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    requests: Mutex<Vec<ExternalRequestInfo>>,
    results: DashMap<(String, bool), u64>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<ExternalRequestInfo> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn ok_count(&self, system: &str) -> u64 {
        self.count(system, true)
    }

    pub fn fail_count(&self, system: &str) -> u64 {
        self.count(system, false)
    }

    fn count(&self, system: &str, ok: bool) -> u64 {
        self.results
            .get(&(system.to_string(), ok))
            .map(|v| *v)
            .unwrap_or(0)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn request(&self, info: ExternalRequestInfo) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(info);
    }

    fn integration_result(&self, system: &str, ok: bool) {
        *self.results.entry((system.to_string(), ok)).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_counters_are_per_system() {
        let metrics = InMemoryMetrics::new();
        metrics.integration_result("remedy", true);
        metrics.integration_result("remedy", false);
        metrics.integration_result("remedy", true);
        metrics.integration_result("ngsa", false);

        assert_eq!(metrics.ok_count("remedy"), 2);
        assert_eq!(metrics.fail_count("remedy"), 1);
        assert_eq!(metrics.fail_count("ngsa"), 1);
        assert_eq!(metrics.ok_count("ngsa"), 0);
    }
}
