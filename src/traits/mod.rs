//! Collaborator traits
//!
//! The admission layer does not talk to providers, classify models, count tokens or export
//! metrics by itself. Each of those concerns sits behind a trait so the surrounding application
//! can plug in its own implementation:
//!
//! - **ModelClient**: the underlying model invocation (one-shot and streaming)
//! - **ClassificationResolver**: maps a caller-facing model id onto a quota tier
//! - **TokenEstimator**: best-effort token count of a request
//! - **MetricsSink**: counters and histograms for attempts, errors, durations and queue sizes

mod classifier;
mod estimator;
mod metrics;
mod model_client;

pub use classifier::{ClassificationResolver, StaticClassifier};
pub use estimator::{HeuristicEstimator, TokenEstimator, estimate_or_fallback};
pub use metrics::{MetricsSink, NoOpMetrics, PrometheusMetrics};
pub use model_client::{ModelClient, ModelStream};
