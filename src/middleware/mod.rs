//! Retry orchestration around model calls
//!
//! [`RetryOrchestrator`] wraps a [`ModelClient`]. Each call is routed by the
//! [`FailoverDecider`]; a provider rate limit disables the model, re-issues the call on the
//! fallback provider when one is usable, and otherwise parks the request and hands the caller a
//! [`RetryLaterSignal`](crate::errors::RetryLaterSignal). Any other provider failure is returned
//! untouched.
//!
//! A conversation may span several processes, so the per-conversation [`RateLimitContext`] is
//! plain data with explicit serialize / deserialize hooks.

mod stream;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::availability::MIN_DISABLE_DURATION;
use crate::errors::{AdmissionError, ProviderError};
use crate::failover::{CallContext, FailoverConfig, FailoverDecider, Route};
use crate::traits::{ClassificationResolver, MetricsSink, ModelClient, ModelStream};
use crate::types::{ModelClassification, ModelKey, ModelRequest, ModelResponse};

use stream::{InBandHandler, rate_limit_aware};

/// Header that carries a serialized [`RateLimitContext`] between processes.
pub const RATE_LIMIT_CONTEXT_HEADER: &str = "x-rate-limit-context";

/// Per-conversation rate-limit settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitContext {
    pub model_class: ModelClassification,
    pub failover: FailoverConfig,
}

impl RateLimitContext {
    pub fn new(model_class: ModelClassification, failover: FailoverConfig) -> Self {
        Self {
            model_class,
            failover,
        }
    }

    /// Build a context for `model_id`, classifying it with `resolver`.
    pub fn resolve(
        resolver: &dyn ClassificationResolver,
        model_id: &str,
        failover: FailoverConfig,
    ) -> Result<Self, AdmissionError> {
        let model_class = resolver
            .classify(model_id)
            .ok_or_else(|| AdmissionError::UnknownModel(model_id.to_string()))?;
        Ok(Self::new(model_class, failover))
    }

    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn deserialize(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn primary_key(&self) -> ModelKey {
        ModelKey::new(self.failover.primary_provider.clone(), self.model_class)
    }
}

pub struct RetryOrchestrator<M: ModelClient> {
    client: Arc<M>,
    decider: FailoverDecider,
    metrics: Arc<dyn MetricsSink>,
    context: RateLimitContext,
}

impl<M: ModelClient> Clone for RetryOrchestrator<M> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            decider: self.decider.clone(),
            metrics: Arc::clone(&self.metrics),
            context: self.context.clone(),
        }
    }
}

impl<M: ModelClient> std::fmt::Debug for RetryOrchestrator<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOrchestrator")
            .field("context", &self.context)
            .finish()
    }
}

impl<M: ModelClient + 'static> RetryOrchestrator<M> {
    pub fn new(
        client: Arc<M>,
        decider: FailoverDecider,
        metrics: Arc<dyn MetricsSink>,
        context: RateLimitContext,
    ) -> Self {
        Self {
            client,
            decider,
            metrics,
            context,
        }
    }

    /// Rebuild an orchestrator from a context produced by [`Self::export_context`].
    pub fn from_exported_context(
        client: Arc<M>,
        decider: FailoverDecider,
        metrics: Arc<dyn MetricsSink>,
        exported: &str,
    ) -> Result<Self, serde_json::Error> {
        let context = RateLimitContext::deserialize(exported)?;
        Ok(Self::new(client, decider, metrics, context))
    }

    pub fn context(&self) -> &RateLimitContext {
        &self.context
    }

    pub fn export_context(&self) -> Result<String, serde_json::Error> {
        self.context.serialize()
    }

    /// One-shot generation.
    #[instrument(skip(self, request), fields(chat_id = %call.chat_id, turn_id = %call.turn_id))]
    pub async fn generate(
        &self,
        call: &CallContext,
        request: ModelRequest,
    ) -> Result<ModelResponse, AdmissionError> {
        let class = self.context.model_class;
        let route = self.route(call, &request).await?;

        let retry_after = match self.invoke(route.key(), &request).await {
            Ok(response) => return Ok(response),
            Err(ProviderError::RateLimited { retry_after, .. }) => retry_after,
            Err(other) => return Err(other.into()),
        };
        self.disable(route.key(), retry_after);

        if let Some(fallback) = self.reissue_target(&route) {
            info!(from = %route.key(), to = %fallback, "Re-issuing rate-limited call on fallback");
            match self.invoke(&fallback, &request).await {
                Ok(response) => return Ok(response),
                Err(ProviderError::RateLimited { retry_after, .. }) => {
                    self.disable(&fallback, retry_after)
                }
                Err(other) => return Err(other.into()),
            }
        }

        let signal = self.decider.enqueue_for_retry(class, call, &request).await?;
        info!(retry_id = %signal.retry_id, "Rate limited, request parked for retry");
        Err(signal.into())
    }

    /// Streaming generation. Failures after the stream opened arrive as in-band error chunks.
    #[instrument(skip(self, request), fields(chat_id = %call.chat_id, turn_id = %call.turn_id))]
    pub async fn stream(
        &self,
        call: &CallContext,
        request: ModelRequest,
    ) -> Result<ModelStream, AdmissionError> {
        let class = self.context.model_class;
        let route = self.route(call, &request).await?;

        let retry_after = match self.open_stream(route.key(), &request).await {
            Ok(stream) => return Ok(self.wrap(stream, route.key().clone(), call, request)),
            Err(ProviderError::RateLimited { retry_after, .. }) => retry_after,
            Err(other) => return Err(other.into()),
        };
        self.disable(route.key(), retry_after);

        if let Some(fallback) = self.reissue_target(&route) {
            info!(from = %route.key(), to = %fallback, "Re-opening rate-limited stream on fallback");
            match self.open_stream(&fallback, &request).await {
                Ok(stream) => return Ok(self.wrap(stream, fallback, call, request)),
                Err(ProviderError::RateLimited { retry_after, .. }) => {
                    self.disable(&fallback, retry_after)
                }
                Err(other) => return Err(other.into()),
            }
        }

        let signal = self.decider.enqueue_for_retry(class, call, &request).await?;
        Err(signal.into())
    }

    async fn route(
        &self,
        call: &CallContext,
        request: &ModelRequest,
    ) -> Result<Route, AdmissionError> {
        self.decider
            .check_model_availability_and_fallback(
                &self.context.primary_key(),
                self.context.model_class,
                &self.context.failover,
                call,
                request,
            )
            .await
    }

    /// The fallback to re-issue on, if the failed route was the primary one.
    fn reissue_target(&self, route: &Route) -> Option<ModelKey> {
        if route.is_fallback() {
            return None;
        }
        self.decider
            .fallback_for(route.key(), self.context.model_class, &self.context.failover)
    }

    fn disable(&self, model: &ModelKey, retry_after: Option<std::time::Duration>) {
        let requested = retry_after.unwrap_or(MIN_DISABLE_DURATION);
        warn!(model = %model, retry_after_ms = requested.as_millis() as u64, "Provider rate limit");
        self.decider
            .availability()
            .temporarily_disable_model(model, requested);
    }

    async fn invoke(
        &self,
        model: &ModelKey,
        request: &ModelRequest,
    ) -> Result<ModelResponse, ProviderError> {
        self.metrics.record_attempt(model);
        let started = Instant::now();
        match self.client.generate(model, request).await {
            Ok(response) => {
                let elapsed = started.elapsed();
                self.metrics.record_duration(model, elapsed);
                debug!(model = %model, elapsed_ms = elapsed.as_millis() as u64, "Model call succeeded");
                Ok(response)
            }
            Err(e) => {
                self.metrics.record_error(model, e.kind());
                Err(e)
            }
        }
    }

    async fn open_stream(
        &self,
        model: &ModelKey,
        request: &ModelRequest,
    ) -> Result<ModelStream, ProviderError> {
        self.metrics.record_attempt(model);
        self.client.stream(model, request).await.inspect_err(|e| {
            self.metrics.record_error(model, e.kind());
        })
    }

    fn wrap(
        &self,
        stream: ModelStream,
        model: ModelKey,
        call: &CallContext,
        request: ModelRequest,
    ) -> ModelStream {
        let handler = InBandHandler {
            decider: self.decider.clone(),
            model,
            classification: self.context.model_class,
            call: call.clone(),
            request,
            metrics: Arc::clone(&self.metrics),
        };
        rate_limit_aware(stream, Arc::new(handler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::availability::AvailabilityTracker;
    use crate::clock::ManualClock;
    use crate::failover::DEFAULT_RETRY_DELAY;
    use crate::queue_manager::QueueManager;
    use crate::store::{KeySpace, MemoryBackend, StoreError};
    use crate::test_utils::{FailingBackend, MockModelClient, MockOutcome, RecordingMetrics};
    use crate::traits::StaticClassifier;
    use crate::types::{Message, StreamChunk};
    use futures_util::StreamExt;
    use std::time::Duration;

    struct Fixture {
        orchestrator: RetryOrchestrator<MockModelClient>,
        client: Arc<MockModelClient>,
        availability: Arc<AvailabilityTracker>,
        queues: QueueManager,
        metrics: Arc<RecordingMetrics>,
    }

    fn fixture_with(fallback: Option<&str>) -> Fixture {
        let clock = Arc::new(ManualClock::new(0));
        let availability = Arc::new(AvailabilityTracker::new(clock.clone()));
        let queues = QueueManager::new(
            Arc::new(MemoryBackend::with_clock(clock.clone())),
            KeySpace::default(),
        );
        let decider = FailoverDecider::new(
            availability.clone(),
            queues.clone(),
            clock,
            DEFAULT_RETRY_DELAY,
        );
        let client = Arc::new(MockModelClient::new());
        let metrics = Arc::new(RecordingMetrics::default());
        let context = RateLimitContext::new(
            ModelClassification::HighFidelity,
            FailoverConfig::new("openai", fallback.map(str::to_string)),
        );
        let orchestrator =
            RetryOrchestrator::new(client.clone(), decider, metrics.clone(), context);
        Fixture {
            orchestrator,
            client,
            availability,
            queues,
            metrics,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Some("anthropic"))
    }

    fn openai() -> ModelKey {
        ModelKey::new("openai", ModelClassification::HighFidelity)
    }

    fn anthropic() -> ModelKey {
        ModelKey::new("anthropic", ModelClassification::HighFidelity)
    }

    fn request() -> ModelRequest {
        ModelRequest::new(vec![Message::user("hello")]).with_param("model", "gpt-4o")
    }

    fn call() -> CallContext {
        CallContext::new("chat", "turn")
    }

    #[tokio::test]
    async fn test_success_records_duration() {
        let f = fixture();
        f.client.respond(&openai(), MockOutcome::text("hi there"));

        let response = f.orchestrator.generate(&call(), request()).await.unwrap();
        assert_eq!(response.content, "hi there");
        assert_eq!(f.metrics.attempts(&openai()), 1);
        assert_eq!(f.metrics.durations(&openai()), 1);
        assert_eq!(f.client.calls(), vec![openai()]);
    }

    #[tokio::test]
    async fn test_rate_limit_reissues_on_fallback() {
        let f = fixture();
        f.client
            .respond(&openai(), MockOutcome::rate_limited(Some(Duration::from_secs(10))));
        f.client.respond(&anthropic(), MockOutcome::text("from fallback"));

        let response = f.orchestrator.generate(&call(), request()).await.unwrap();
        assert_eq!(response.content, "from fallback");
        assert!(!f.availability.is_model_available(&openai()));
        assert_eq!(f.client.calls(), vec![openai(), anthropic()]);
        assert_eq!(f.metrics.errors(&openai(), "rate_limit"), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_without_fallback_parks_request() {
        let f = fixture_with(None);
        f.client.respond(&openai(), MockOutcome::rate_limited(None));

        let err = f.orchestrator.generate(&call(), request()).await.unwrap_err();
        let signal = err.retry_signal().cloned().expect("retry signal");
        assert_eq!(signal.chat_id, "chat");
        assert!(f.queues.check_if_request_exists(&signal.retry_id).await.unwrap());
        assert!(!f.availability.is_model_available(&openai()));
    }

    #[tokio::test]
    async fn test_both_providers_limited_parks_request() {
        let f = fixture();
        f.client.respond(&openai(), MockOutcome::rate_limited(None));
        f.client.respond(&anthropic(), MockOutcome::rate_limited(None));

        let err = f.orchestrator.generate(&call(), request()).await.unwrap_err();
        assert!(matches!(err, AdmissionError::RetryLater(_)));
        assert!(!f.availability.is_model_available(&anthropic()));

        // Both are now disabled: the next call is parked without touching a provider.
        let err = f.orchestrator.generate(&call(), request()).await.unwrap_err();
        assert!(matches!(err, AdmissionError::RetryLater(_)));
        assert_eq!(f.client.calls().len(), 2);
        assert_eq!(
            f.queues
                .queue_length(1, ModelClassification::HighFidelity)
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_other_errors_pass_through_unchanged() {
        let f = fixture();
        let upstream = ProviderError::Upstream {
            model: openai().to_string(),
            status: Some(500),
            message: "boom".into(),
        };
        f.client
            .respond(&openai(), MockOutcome::Fail(upstream.clone()));

        let err = f.orchestrator.generate(&call(), request()).await.unwrap_err();
        assert!(matches!(err, AdmissionError::Provider(e) if e == upstream));
        assert!(f.availability.is_model_available(&openai()));
        assert_eq!(f.metrics.errors(&openai(), "provider_error"), 1);
        assert_eq!(f.client.calls(), vec![openai()]);
    }

    #[tokio::test]
    async fn test_store_failure_is_surfaced() {
        let clock = Arc::new(ManualClock::new(0));
        let availability = Arc::new(AvailabilityTracker::new(clock.clone()));
        let queues = QueueManager::new(Arc::new(FailingBackend), KeySpace::default());
        let decider = FailoverDecider::new(availability, queues, clock, DEFAULT_RETRY_DELAY);
        let client = Arc::new(MockModelClient::new());
        client.respond(&openai(), MockOutcome::rate_limited(None));
        let orchestrator = RetryOrchestrator::new(
            client,
            decider,
            Arc::new(RecordingMetrics::default()),
            RateLimitContext::new(
                ModelClassification::HighFidelity,
                FailoverConfig::new("openai", None),
            ),
        );

        let err = orchestrator.generate(&call(), request()).await.unwrap_err();
        assert!(matches!(err, AdmissionError::Store(_)));
    }

    #[tokio::test]
    async fn test_stream_in_band_rate_limit_attaches_signal() {
        let f = fixture_with(None);
        f.client.respond(
            &openai(),
            MockOutcome::Chunks(vec![
                StreamChunk::TextDelta("partial ".into()),
                StreamChunk::Error {
                    error: ProviderError::RateLimited {
                        model: openai().to_string(),
                        message: "slow down".into(),
                        retry_after: Some(Duration::from_secs(5)),
                    },
                    retry: None,
                },
                StreamChunk::Finish { usage: None },
            ]),
        );

        let stream = f.orchestrator.stream(&call(), request()).await.unwrap();
        let chunks: Vec<_> = stream.collect().await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], StreamChunk::TextDelta("partial ".into()));
        let StreamChunk::Error { retry, .. } = &chunks[1] else {
            panic!("expected an error chunk, got {:?}", chunks[1]);
        };
        let signal = retry.as_ref().expect("signal attached");
        assert!(f.queues.check_if_request_exists(&signal.retry_id).await.unwrap());
        assert!(matches!(chunks[2], StreamChunk::Finish { .. }));
        assert!(!f.availability.is_model_available(&openai()));
    }

    #[tokio::test]
    async fn test_stream_rate_limit_without_hint_disables_for_the_floor() {
        let f = fixture_with(None);
        f.client.respond(
            &openai(),
            MockOutcome::Chunks(vec![StreamChunk::Error {
                error: ProviderError::RateLimited {
                    model: openai().to_string(),
                    message: "slow down".into(),
                    retry_after: None,
                },
                retry: None,
            }]),
        );

        let stream = f.orchestrator.stream(&call(), request()).await.unwrap();
        let _: Vec<_> = stream.collect().await;

        assert_eq!(
            f.availability.disabled_until(&openai()),
            Some(MIN_DISABLE_DURATION.as_millis() as u64)
        );
    }

    #[tokio::test]
    async fn test_stream_park_failure_follows_the_error_chunk() {
        let clock = Arc::new(ManualClock::new(0));
        let availability = Arc::new(AvailabilityTracker::new(clock.clone()));
        let queues = QueueManager::new(Arc::new(FailingBackend), KeySpace::default());
        let decider =
            FailoverDecider::new(availability.clone(), queues, clock, DEFAULT_RETRY_DELAY);
        let client = Arc::new(MockModelClient::new());
        client.respond(
            &openai(),
            MockOutcome::Chunks(vec![
                StreamChunk::TextDelta("partial".into()),
                StreamChunk::Error {
                    error: ProviderError::RateLimited {
                        model: openai().to_string(),
                        message: "slow down".into(),
                        retry_after: None,
                    },
                    retry: None,
                },
                StreamChunk::Finish { usage: None },
            ]),
        );
        let orchestrator = RetryOrchestrator::new(
            client,
            decider,
            Arc::new(RecordingMetrics::default()),
            RateLimitContext::new(
                ModelClassification::HighFidelity,
                FailoverConfig::new("openai", None),
            ),
        );

        let stream = orchestrator.stream(&call(), request()).await.unwrap();
        let chunks: Vec<_> = stream.collect().await;

        assert_eq!(chunks.len(), 4);
        assert!(matches!(chunks[1], StreamChunk::Error { retry: None, .. }));
        assert!(matches!(
            chunks[2],
            StreamChunk::StoreFailure(StoreError::Unavailable(_))
        ));
        assert!(matches!(chunks[3], StreamChunk::Finish { .. }));
        assert!(!availability.is_model_available(&openai()));
    }

    #[tokio::test]
    async fn test_stream_open_rate_limit_fails_over() {
        let f = fixture();
        f.client.respond(&openai(), MockOutcome::rate_limited(None));
        f.client.respond(&anthropic(), MockOutcome::text("streamed"));

        let stream = f.orchestrator.stream(&call(), request()).await.unwrap();
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks[0], StreamChunk::TextDelta("streamed".into()));
        assert_eq!(f.client.calls(), vec![openai(), anthropic()]);
    }

    #[tokio::test]
    async fn test_disabled_primary_routes_to_fallback_up_front() {
        let f = fixture();
        f.availability
            .temporarily_disable_model(&openai(), Duration::from_secs(60));
        f.client.respond(&anthropic(), MockOutcome::text("fallback"));

        let response = f.orchestrator.generate(&call(), request()).await.unwrap();
        assert_eq!(response.content, "fallback");
        assert_eq!(f.client.calls(), vec![anthropic()]);
    }

    #[test]
    fn test_context_survives_serialization() {
        let f = fixture();
        let exported = f.orchestrator.export_context().unwrap();
        let value: serde_json::Value = serde_json::from_str(&exported).unwrap();
        assert_eq!(value["modelClass"], "high-fidelity");
        assert_eq!(value["failover"]["primaryProvider"], "openai");
        assert_eq!(value["failover"]["fallbackProvider"], "anthropic");

        let restored = RetryOrchestrator::from_exported_context(
            f.client.clone(),
            f.orchestrator.decider.clone(),
            f.metrics.clone(),
            &exported,
        )
        .unwrap();
        assert_eq!(restored.context(), f.orchestrator.context());
    }

    #[test]
    fn test_context_resolves_classification() {
        let classifier =
            StaticClassifier::default().with("gpt-4o-mini", ModelClassification::LowFidelity);
        let context = RateLimitContext::resolve(
            &classifier,
            "gpt-4o-mini",
            FailoverConfig::new("openai", None),
        )
        .unwrap();
        assert_eq!(context.model_class, ModelClassification::LowFidelity);

        let err = RateLimitContext::resolve(&classifier, "mystery", FailoverConfig::new("x", None))
            .unwrap_err();
        assert!(matches!(err, AdmissionError::UnknownModel(id) if id == "mystery"));
    }
}
