//! Gateway configuration file
//!
//! The binary reads one JSON document describing providers, the caller-facing model ids, the
//! failover pair, which models are metered through a
//! [`LanguageModelQueue`](crate::model_queue::LanguageModelQueue) and how parked
//! requests are retried:
//!
//! ```json
//! {
//!   "providers": {
//!     "openai": {"url": "https://api.openai.com", "apiKey": "sk-...",
//!                "models": {"high-fidelity": "gpt-4o", "low-fidelity": "gpt-4o-mini"}}
//!   },
//!   "models": {"gpt-4o": "high-fidelity", "gpt-4o-mini": "low-fidelity"},
//!   "failover": {"primaryProvider": "openai", "fallbackProvider": "anthropic"},
//!   "queues": [{"model": "openai:high-fidelity", "tokensPerMinute": 30000}],
//!   "retry": {"retryDelaySecs": 60, "maxGeneration": 3}
//! }
//! ```
use anyhow::{Context, anyhow, bail};
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::availability::MIN_DISABLE_DURATION;
use crate::failover::{DEFAULT_RETRY_DELAY, FailoverConfig};
use crate::model_queue::{
    DEFAULT_MAX_CONCURRENT_REQUESTS, DEFAULT_OUTPUT_RESERVE, DEFAULT_PENDING_TIMEOUT,
    DEFAULT_PROCESSING_TIMEOUT, DEFAULT_STALE_AFTER, DEFAULT_TICK_INTERVAL, LanguageModelQueueConfig,
};
use crate::provider::ProviderConfig;
use crate::queue_manager::DEFAULT_MAX_GENERATION;
use crate::retry_client::{DEFAULT_MAX_RETRIES, MIN_POLL_BACKOFF, RetryPollerConfig};
use crate::traits::StaticClassifier;
use crate::types::{ModelClassification, ModelKey};
use crate::worker::{DEFAULT_BATCH_SIZE, DEFAULT_POLL_INTERVAL, WorkerConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayFile {
    pub providers: HashMap<String, ProviderConfig>,
    /// Caller-facing model id to quota tier.
    #[serde(default)]
    pub models: HashMap<String, ModelClassification>,
    pub failover: FailoverConfig,
    #[serde(default)]
    pub queues: Vec<QueueSettings>,
    #[serde(default)]
    pub retry: RetrySettings,
}

/// One metered model.
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct QueueSettings {
    pub model: ModelKey,
    pub tokens_per_minute: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_reserve: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_requests: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_after_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_timeout_secs: Option<u64>,
}

impl QueueSettings {
    pub fn queue_config(&self) -> LanguageModelQueueConfig {
        LanguageModelQueueConfig::builder()
            .model(self.model.clone())
            .tokens_per_minute(self.tokens_per_minute)
            .maybe_requests_per_minute(self.requests_per_minute)
            .output_reserve(self.output_reserve.unwrap_or(DEFAULT_OUTPUT_RESERVE))
            .max_concurrent_requests(
                self.max_concurrent_requests
                    .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS),
            )
            .tick_interval(
                self.tick_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_TICK_INTERVAL),
            )
            .stale_after(
                self.stale_after_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_STALE_AFTER),
            )
            .processing_timeout(
                self.processing_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_PROCESSING_TIMEOUT),
            )
            .pending_timeout(
                self.pending_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_PENDING_TIMEOUT),
            )
            .build()
    }
}

/// How parked requests are retried, by the worker and by polling callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    /// Hint handed to callers before their first poll.
    #[builder(default = DEFAULT_RETRY_DELAY.as_secs())]
    pub retry_delay_secs: u64,
    #[builder(default = DEFAULT_MAX_GENERATION)]
    pub max_generation: u32,
    /// Floor for how long a rate-limited model stays disabled.
    #[builder(default = MIN_DISABLE_DURATION.as_secs())]
    pub min_disable_secs: u64,
    #[builder(default = DEFAULT_POLL_INTERVAL.as_secs())]
    pub worker_poll_interval_secs: u64,
    #[builder(default = DEFAULT_BATCH_SIZE)]
    pub worker_batch_size: usize,
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_poll_retries: u32,
    #[builder(default = MIN_POLL_BACKOFF.as_secs())]
    pub min_poll_backoff_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetrySettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn min_disable(&self) -> Duration {
        Duration::from_secs(self.min_disable_secs)
    }

    pub fn poller_config(&self) -> RetryPollerConfig {
        RetryPollerConfig::builder()
            .max_retries(self.max_poll_retries)
            .min_backoff(Duration::from_secs(self.min_poll_backoff_secs))
            .build()
    }
}

impl GatewayFile {
    pub async fn from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let file: GatewayFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        file.validate()?;

        info!(
            providers = file.providers.len(),
            models = file.models.len(),
            queues = file.queues.len(),
            "Loaded gateway config from {}",
            path.display()
        );
        Ok(file)
    }

    /// Every provider named by the failover pair and the queues must be configured.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let known = |provider: &str| self.providers.contains_key(provider);

        if !known(&self.failover.primary_provider) {
            bail!(
                "primary provider '{}' is not configured",
                self.failover.primary_provider
            );
        }
        if let Some(fallback) = &self.failover.fallback_provider
            && !known(fallback)
        {
            bail!("fallback provider '{fallback}' is not configured");
        }

        for queue in &self.queues {
            let provider = self
                .providers
                .get(queue.model.provider())
                .ok_or_else(|| anyhow!("queue for {} names an unknown provider", queue.model))?;
            if !provider.models.contains_key(&queue.model.classification()) {
                bail!(
                    "provider '{}' has no model for {}",
                    queue.model.provider(),
                    queue.model.classification()
                );
            }
            let config = queue.queue_config();
            if config.token_budget() == 0 {
                bail!(
                    "queue for {} leaves no tokens after the output reserve",
                    queue.model
                );
            }
            debug!(model = %queue.model, budget = config.token_budget(), "Queue configured");
        }
        Ok(())
    }

    pub fn classifier(&self) -> StaticClassifier {
        StaticClassifier::new(self.models.clone())
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::builder()
            .failover(self.failover.clone())
            .poll_interval(Duration::from_secs(self.retry.worker_poll_interval_secs))
            .batch_size(self.retry.worker_batch_size)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ClassificationResolver;
    use serde_json::json;

    fn sample() -> serde_json::Value {
        json!({
            "providers": {
                "openai": {
                    "url": "https://api.openai.com",
                    "apiKey": "sk-test",
                    "models": {"high-fidelity": "gpt-4o", "embedding": "text-embedding-3-small"}
                },
                "anthropic": {
                    "url": "https://api.anthropic.com",
                    "models": {"high-fidelity": "claude-sonnet"}
                }
            },
            "models": {"gpt-4o": "high-fidelity"},
            "failover": {"primaryProvider": "openai", "fallbackProvider": "anthropic"},
            "queues": [{
                "model": "openai:high-fidelity",
                "tokensPerMinute": 30000,
                "maxConcurrentRequests": 2,
                "tickIntervalMs": 250
            }]
        })
    }

    #[test]
    fn test_parses_and_applies_defaults() {
        let file: GatewayFile = serde_json::from_value(sample()).unwrap();
        file.validate().unwrap();

        assert_eq!(file.retry, RetrySettings::default());
        assert_eq!(file.retry.retry_delay(), DEFAULT_RETRY_DELAY);
        assert_eq!(
            file.classifier().classify("gpt-4o-2024-08-06"),
            Some(ModelClassification::HighFidelity)
        );

        let queue = file.queues[0].queue_config();
        assert_eq!(queue.max_concurrent_requests, 2);
        assert_eq!(queue.tick_interval, Duration::from_millis(250));
        assert_eq!(queue.output_reserve, DEFAULT_OUTPUT_RESERVE);
        assert_eq!(queue.token_budget(), 30_000 - DEFAULT_OUTPUT_RESERVE);

        let worker = file.worker_config();
        assert_eq!(worker.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(worker.failover.fallback_provider.as_deref(), Some("anthropic"));
    }

    #[test]
    fn test_partial_retry_settings_keep_defaults() {
        let mut raw = sample();
        raw["retry"] = json!({"maxGeneration": 5});
        let file: GatewayFile = serde_json::from_value(raw).unwrap();

        assert_eq!(file.retry.max_generation, 5);
        assert_eq!(file.retry.min_poll_backoff_secs, MIN_POLL_BACKOFF.as_secs());
        assert_eq!(file.retry.poller_config().max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_queue_timeouts_are_configurable() {
        let mut raw = sample();
        raw["queues"][0]["pendingTimeoutSecs"] = json!(120);
        let file: GatewayFile = serde_json::from_value(raw).unwrap();

        let queue = file.queues[0].queue_config();
        assert_eq!(queue.pending_timeout, Duration::from_secs(120));
        assert_eq!(queue.processing_timeout, DEFAULT_PROCESSING_TIMEOUT);
    }

    #[rstest::rstest]
    #[case::unknown_primary(json!({"primaryProvider": "mystery"}), None)]
    #[case::unknown_fallback(
        json!({"primaryProvider": "openai", "fallbackProvider": "mystery"}),
        None
    )]
    #[case::queue_without_model(
        json!({"primaryProvider": "openai"}),
        Some(json!([{"model": "anthropic:embedding", "tokensPerMinute": 1000}]))
    )]
    #[case::reserve_eats_budget(
        json!({"primaryProvider": "openai"}),
        Some(json!([{"model": "openai:high-fidelity", "tokensPerMinute": 4000}]))
    )]
    fn test_rejects_inconsistent_files(
        #[case] failover: serde_json::Value,
        #[case] queues: Option<serde_json::Value>,
    ) {
        let mut raw = sample();
        raw["failover"] = failover;
        raw["queues"] = queues.unwrap_or_else(|| json!([]));
        let file: GatewayFile = serde_json::from_value(raw).unwrap();
        assert!(file.validate().is_err());
    }

    #[tokio::test]
    async fn test_missing_file_reports_path() {
        let err = GatewayFile::from_file(Path::new("/nonexistent/gateway.json"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/gateway.json"));
    }
}
