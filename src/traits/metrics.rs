//! Metrics sink.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

use crate::types::ModelKey;

pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    /// A call was issued against `model`.
    fn record_attempt(&self, model: &ModelKey);

    /// A call against `model` completed successfully after `elapsed`.
    fn record_duration(&self, model: &ModelKey, elapsed: Duration);

    /// A call against `model` failed; `kind` is a short label such as `rate_limit`.
    fn record_error(&self, model: &ModelKey, kind: &'static str);

    /// Current depth of the queue called `queue`.
    fn record_queue_size(&self, queue: &str, size: usize);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl MetricsSink for NoOpMetrics {
    fn record_attempt(&self, _model: &ModelKey) {}

    fn record_duration(&self, _model: &ModelKey, _elapsed: Duration) {}

    fn record_error(&self, _model: &ModelKey, _kind: &'static str) {}

    fn record_queue_size(&self, _queue: &str, _size: usize) {}
}

/// Records through the `metrics` facade, which the Prometheus exporter installed by the binary
/// renders on the metrics port.
#[derive(Debug, Clone)]
pub struct PrometheusMetrics {
    prefix: String,
}

impl PrometheusMetrics {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn name(&self, metric: &str) -> String {
        format!("{}_{}", self.prefix, metric)
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_attempt(&self, model: &ModelKey) {
        counter!(self.name("model_attempts_total"), "model" => model.to_string()).increment(1);
    }

    fn record_duration(&self, model: &ModelKey, elapsed: Duration) {
        histogram!(self.name("model_duration_seconds"), "model" => model.to_string())
            .record(elapsed.as_secs_f64());
    }

    fn record_error(&self, model: &ModelKey, kind: &'static str) {
        counter!(
            self.name("model_errors_total"),
            "model" => model.to_string(),
            "kind" => kind
        )
        .increment(1);
    }

    fn record_queue_size(&self, queue: &str, size: usize) {
        gauge!(self.name("queue_size"), "queue" => queue.to_string()).set(size as f64);
    }
}
