use crate::error::{RateLimitError, Result};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Metrics service for collecting and exposing Prometheus metrics
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Install the Prometheus recorder. Only one recorder may exist per process.
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            RateLimitError::Configuration(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn register_metrics() {
        describe_counter!(
            "dlimit_decisions_total",
            "Total number of admission decisions, by policy and outcome"
        );
        describe_histogram!(
            "dlimit_decision_duration_seconds",
            "Latency of admission decisions in seconds, store round-trip included"
        );
        describe_counter!(
            "dlimit_store_errors_total",
            "Total number of failed store operations"
        );
        describe_counter!(
            "dlimit_failure_mode_fallbacks_total",
            "Decisions answered by the configured failure mode instead of the store"
        );

        debug!("All metrics registered with descriptions");
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Record one admission decision
pub fn record_decision(policy: &str, algorithm: &str, allowed: bool, duration: f64) {
    let labels = [
        ("policy", policy.to_string()),
        ("algorithm", algorithm.to_string()),
        ("outcome", outcome(allowed).to_string()),
    ];

    counter!("dlimit_decisions_total", &labels).increment(1);
    histogram!("dlimit_decision_duration_seconds", &labels).record(duration);
}

/// Record a failed store operation
pub fn record_store_error(policy: &str, operation: &str) {
    let labels = [
        ("policy", policy.to_string()),
        ("operation", operation.to_string()),
    ];
    counter!("dlimit_store_errors_total", &labels).increment(1);
}

/// Record a decision made by the failure mode
pub fn record_fallback(policy: &str, allowed: bool) {
    let labels = [
        ("policy", policy.to_string()),
        ("outcome", outcome(allowed).to_string()),
    ];
    counter!("dlimit_failure_mode_fallbacks_total", &labels).increment(1);
}

fn outcome(allowed: bool) -> &'static str {
    if allowed {
        "allowed"
    } else {
        "denied"
    }
}

/// Timer for one admission decision
pub struct DecisionTimer {
    start: Instant,
    policy: String,
    algorithm: &'static str,
}

impl DecisionTimer {
    pub fn new(policy: &str, algorithm: &'static str) -> Self {
        Self {
            start: Instant::now(),
            policy: policy.to_string(),
            algorithm,
        }
    }

    /// Record the decision with the elapsed time
    pub fn record(self, allowed: bool) {
        record_decision(&self.policy, self.algorithm, allowed, self.elapsed());
    }

    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}
