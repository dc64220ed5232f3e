//! queuekeeper - admission control in front of LLM providers
//!
//! This library keeps model calls inside provider quotas. It tracks which models are cooling
//! down after a rate limit, fails over to a second provider, parks requests that cannot run
//! anywhere in durable retry queues, and meters calls per model through token-budgeted queues.
//!
//! The pieces are usable on their own; [`build_router`] wires them into an HTTP gateway.

use axum::Router;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod availability;
pub mod client;
pub mod clock;
pub mod errors;
pub mod failover;
pub mod gateway;
pub mod handlers;
pub mod middleware;
pub mod model_queue;
pub mod provider;
pub mod queue_manager;
pub mod queue_router;
pub mod retry_client;
pub mod sse;
pub mod store;
pub mod traits;
pub mod types;
pub mod worker;

use failover::{FailoverConfig, FailoverDecider};
use traits::{ClassificationResolver, MetricsSink, ModelClient};

/// Everything a request handler needs, shared across requests.
#[derive(Debug)]
pub struct AppState<M: ModelClient> {
    pub client: Arc<M>,
    pub decider: FailoverDecider,
    pub classifier: Arc<dyn ClassificationResolver>,
    pub metrics: Arc<dyn MetricsSink>,
    /// Providers used when a caller does not send its own rate-limit context.
    pub failover: FailoverConfig,
}

impl<M: ModelClient> Clone for AppState<M> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            decider: self.decider.clone(),
            classifier: Arc::clone(&self.classifier),
            metrics: Arc::clone(&self.metrics),
            failover: self.failover.clone(),
        }
    }
}

impl<M: ModelClient> AppState<M> {
    pub fn new(
        client: Arc<M>,
        decider: FailoverDecider,
        classifier: Arc<dyn ClassificationResolver>,
        metrics: Arc<dyn MetricsSink>,
        failover: FailoverConfig,
    ) -> Self {
        Self {
            client,
            decider,
            classifier,
            metrics,
            failover,
        }
    }
}

/// Build the gateway router
/// This creates routes for:
/// - `/v1/generate` - One-shot generation
/// - `/v1/stream` - Streamed generation as server-sent events
/// - `/v1/responses/{id}` - Outcome of a parked request (GET, DELETE)
/// - `/v1/requests/{id}` - Whether a parked request is still waiting
#[instrument(skip(state))]
pub fn build_router<M: ModelClient + 'static>(state: AppState<M>) -> Router {
    info!("Building router");
    Router::new()
        .route("/v1/generate", post(handlers::generate::<M>))
        .route("/v1/stream", post(handlers::stream::<M>))
        .route(
            "/v1/responses/{id}",
            get(handlers::get_response::<M>).delete(handlers::delete_response::<M>),
        )
        .route("/v1/requests/{id}", get(handlers::get_request::<M>))
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// Building the pair installs the global recorder, so the model metrics written by
/// [`PrometheusMetrics`](traits::PrometheusMetrics) are rendered by the same handle.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::MatchedPath)
        .with_default_metrics()
        .build_pair()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::availability::AvailabilityTracker;
    use crate::clock::ManualClock;
    use crate::failover::DEFAULT_RETRY_DELAY;
    use crate::middleware::{RATE_LIMIT_CONTEXT_HEADER, RateLimitContext};
    use crate::queue_manager::QueueManager;
    use crate::store::{KeySpace, MemoryBackend, StoreError};
    use crate::test_utils::{MockModelClient, MockOutcome, RecordingMetrics, sample_response};
    use crate::traits::StaticClassifier;
    use crate::types::{ModelClassification, ModelKey};
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::{Value, json};
    use std::time::Duration;

    struct Fixture {
        server: TestServer,
        client: Arc<MockModelClient>,
        availability: Arc<AvailabilityTracker>,
        queues: QueueManager,
    }

    fn openai() -> ModelKey {
        ModelKey::new("openai", ModelClassification::HighFidelity)
    }

    fn anthropic() -> ModelKey {
        ModelKey::new("anthropic", ModelClassification::HighFidelity)
    }

    fn fixture(fallback: Option<&str>) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000_000));
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
        let state = AppState::new(
            client.clone(),
            decider,
            Arc::new(
                StaticClassifier::default().with("gpt-4o", ModelClassification::HighFidelity),
            ),
            Arc::new(RecordingMetrics::default()),
            FailoverConfig::new("openai", fallback.map(String::from)),
        );
        Fixture {
            server: TestServer::new(build_router(state)).unwrap(),
            client,
            availability,
            queues,
        }
    }

    fn body() -> Value {
        json!({
            "chatId": "chat-1",
            "turnId": "turn-1",
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hello"}],
            "temperature": 0.3
        })
    }

    #[tokio::test]
    async fn test_generate_returns_result_and_context() {
        let f = fixture(None);
        f.client.respond(&openai(), MockOutcome::text("Hi there"));

        let response = f.server.post("/v1/generate").json(&body()).await;
        response.assert_status_ok();
        assert_eq!(response.json::<Value>()["content"], "Hi there");

        let context = response.header(RATE_LIMIT_CONTEXT_HEADER);
        let context = RateLimitContext::deserialize(context.to_str().unwrap()).unwrap();
        assert_eq!(context.model_class, ModelClassification::HighFidelity);
        assert_eq!(context.failover.primary_provider, "openai");
    }

    #[tokio::test]
    async fn test_rate_limited_generate_returns_accepted_with_signal() {
        let f = fixture(None);
        f.client
            .respond(&openai(), MockOutcome::rate_limited(Some(Duration::from_secs(90))));

        let response = f.server.post("/v1/generate").json(&body()).await;
        response.assert_status(StatusCode::ACCEPTED);

        let signal: Value = response.json();
        assert_eq!(signal["chatId"], "chat-1");
        let retry_id = signal["retryId"].as_str().unwrap();
        assert!(f.queues.check_if_request_exists(retry_id).await.unwrap());
        assert!(!f.availability.is_model_available(&openai()));

        let response = f.server.get(&format!("/v1/requests/{retry_id}")).await;
        response.assert_status_ok();
        assert_eq!(response.json::<Value>()["exists"], true);
    }

    #[tokio::test]
    async fn test_context_header_overrides_defaults() {
        let f = fixture(None);
        f.availability
            .temporarily_disable_model(&openai(), Duration::from_secs(60));
        f.client.respond(&anthropic(), MockOutcome::text("from fallback"));

        let context = RateLimitContext::new(
            ModelClassification::HighFidelity,
            FailoverConfig::new("openai", Some("anthropic".into())),
        );
        let response = f
            .server
            .post("/v1/generate")
            .add_header(RATE_LIMIT_CONTEXT_HEADER, context.serialize().unwrap())
            .json(&body())
            .await;

        response.assert_status_ok();
        assert_eq!(f.client.calls(), vec![anthropic()]);
    }

    #[tokio::test]
    async fn test_bad_requests() {
        let f = fixture(None);

        let mut unknown = body();
        unknown["model"] = json!("llama3");
        f.server
            .post("/v1/generate")
            .json(&unknown)
            .await
            .assert_status(StatusCode::NOT_FOUND);

        f.server
            .post("/v1/generate")
            .add_header(RATE_LIMIT_CONTEXT_HEADER, "not json")
            .json(&body())
            .await
            .assert_status_bad_request();

        f.server
            .post("/v1/generate")
            .json(&json!({"model": "gpt-4o"}))
            .await
            .assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        assert!(f.client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_provider_failure_keeps_status() {
        let f = fixture(None);
        f.client.respond(
            &openai(),
            MockOutcome::Fail(crate::errors::ProviderError::Rejected {
                model: openai().to_string(),
                status: Some(400),
                message: "context too long".into(),
            }),
        );

        let response = f.server.post("/v1/generate").json(&body()).await;
        response.assert_status_bad_request();
        assert_eq!(response.json::<Value>()["error"]["type"], "rejected");
    }

    #[tokio::test]
    async fn test_store_outage_behind_the_client_is_service_unavailable() {
        let f = fixture(None);
        f.client.respond(
            &openai(),
            MockOutcome::Fail(
                crate::errors::AdmissionError::Store(StoreError::Unavailable("down".into())).into(),
            ),
        );

        let response = f.server.post("/v1/generate").json(&body()).await;
        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.json::<Value>()["error"]["type"], "store_error");
        // Not a rate limit, so the model stays usable.
        assert!(f.availability.is_model_available(&openai()));
    }

    #[tokio::test]
    async fn test_stream_emits_events() {
        let f = fixture(None);
        f.client.respond(&openai(), MockOutcome::text("streamed"));

        let response = f.server.post("/v1/stream").json(&body()).await;
        response.assert_status_ok();
        let text = response.text();
        assert!(text.contains("event: delta\ndata: streamed"));
        assert!(text.contains("event: finish"));
    }

    #[tokio::test]
    async fn test_response_lookup_and_removal() {
        let f = fixture(None);
        f.queues
            .store_response(&sample_response("r1", "parked result"))
            .await
            .unwrap();

        let response = f.server.get("/v1/responses/r1").await;
        response.assert_status_ok();
        assert_eq!(
            response.json::<Value>()["response"]["content"],
            "parked result"
        );

        f.server
            .delete("/v1/responses/r1")
            .await
            .assert_status(StatusCode::NO_CONTENT);
        f.server
            .get("/v1/responses/r1")
            .await
            .assert_status_not_found();
        f.server
            .delete("/v1/responses/r1")
            .await
            .assert_status_not_found();
        f.server
            .get("/v1/requests/r1")
            .await
            .assert_status_not_found();
    }
}
