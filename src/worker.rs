//! Background processing of parked requests
//!
//! The [`RetryQueueWorker`] drains the retry queues whenever a provider for their
//! classification is usable again and writes each outcome to the response store, where
//! [`RetryPoller`](crate::retry_client::RetryPoller) picks it up.
//!
//! A request that is rate limited again moves one generation up. Once it is rate limited at the
//! highest generation, a `rate_limit` failure is stored for it instead.
use bon::Builder;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::availability::{AvailabilityTracker, MIN_DISABLE_DURATION};
use crate::clock::Clock;
use crate::errors::ProviderError;
use crate::failover::FailoverConfig;
use crate::queue_manager::QueueManager;
use crate::store::StoreError;
use crate::traits::{MetricsSink, ModelClient};
use crate::types::{
    ModelClassification, ModelKey, ProcessedResponse, RateLimitedRequest, ResponseError,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Builder)]
pub struct WorkerConfig {
    pub failover: FailoverConfig,
    #[builder(default = DEFAULT_POLL_INTERVAL)]
    pub poll_interval: Duration,
    /// Requests taken from one queue per pass.
    #[builder(default = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,
}

/// Counts for a single pass over the queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub succeeded: usize,
    pub failed: usize,
    pub requeued: usize,
}

pub struct RetryQueueWorker {
    client: Arc<dyn ModelClient>,
    queues: QueueManager,
    availability: Arc<AvailabilityTracker>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
}

impl std::fmt::Debug for RetryQueueWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryQueueWorker")
            .field("config", &self.config)
            .finish()
    }
}

impl RetryQueueWorker {
    pub fn new(
        client: Arc<dyn ModelClient>,
        queues: QueueManager,
        availability: Arc<AvailabilityTracker>,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            client,
            queues,
            availability,
            metrics,
            clock,
            config,
        }
    }

    /// Poll until `shutdown` fires. A backing-store failure stops the worker and is returned.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), StoreError> {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting retry queue worker"
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.process_once().await {
                        error!(error = %e, "Retry queue worker stopped on a store failure");
                        return Err(e);
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Retry queue worker shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// The usable model for `classification`, primary first.
    fn pick_model(&self, classification: ModelClassification) -> Option<ModelKey> {
        let failover = &self.config.failover;
        self.availability
            .get_available_model(&failover.primary_provider, classification)
            .or_else(|| {
                failover.fallback_provider.as_deref().and_then(|fallback| {
                    self.availability
                        .get_available_model(fallback, classification)
                })
            })
    }

    /// One pass over every generation and classification.
    ///
    /// Requests are taken off a queue one at a time, up to `batch_size` per queue, so a store
    /// failure loses at most the request in hand.
    #[instrument(skip(self))]
    pub async fn process_once(&self) -> Result<WorkerReport, StoreError> {
        let mut report = WorkerReport::default();
        for generation in 1..=self.queues.max_generation() {
            for classification in ModelClassification::ALL {
                let mut taken = 0;
                while taken < self.config.batch_size {
                    // A rate limit earlier in the pass may have exhausted every provider.
                    let Some(model) = self.pick_model(classification) else {
                        break;
                    };
                    let Some(request) = self
                        .queues
                        .dequeue_requests(generation, classification, 1)
                        .await?
                        .pop()
                    else {
                        break;
                    };
                    taken += 1;
                    self.process(request, model, &mut report).await?;
                }
                if taken > 0 {
                    debug!(generation, %classification, count = taken, "Processed parked requests");
                }
            }
        }
        if report != WorkerReport::default() {
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                requeued = report.requeued,
                "Retry queue pass finished"
            );
        }
        Ok(report)
    }

    async fn process(
        &self,
        request: RateLimitedRequest,
        model: ModelKey,
        report: &mut WorkerReport,
    ) -> Result<(), StoreError> {
        self.metrics.record_attempt(&model);
        let started = Instant::now();
        match self.client.generate(&model, &request.request).await {
            Ok(response) => {
                self.metrics.record_duration(&model, started.elapsed());
                let processed =
                    ProcessedResponse::success(&request.id, response, self.clock.now_ms());
                self.queues.store_response(&processed).await?;
                debug!(id = %request.id, model = %model, "Parked request completed");
                report.succeeded += 1;
            }
            Err(error @ ProviderError::RateLimited { .. }) => {
                self.metrics.record_error(&model, error.kind());
                self.availability.temporarily_disable_model(
                    &model,
                    error.retry_after().unwrap_or(MIN_DISABLE_DURATION),
                );
                let generation = request.metadata.generation;
                if generation < self.queues.max_generation() {
                    let mut next = request;
                    next.metadata.generation = generation + 1;
                    self.queues.enqueue_request(&next).await?;
                    debug!(id = %next.id, generation = generation + 1, "Parked request moved up a generation");
                    report.requeued += 1;
                } else {
                    warn!(id = %request.id, generation, "Parked request rate limited at the last generation");
                    self.store_failure(&request.id, &error).await?;
                    report.failed += 1;
                }
            }
            Err(error) => {
                self.metrics.record_error(&model, error.kind());
                warn!(id = %request.id, error = %error, "Parked request failed");
                self.store_failure(&request.id, &error).await?;
                report.failed += 1;
            }
        }
        Ok(())
    }

    async fn store_failure(&self, id: &str, error: &ProviderError) -> Result<(), StoreError> {
        let processed =
            ProcessedResponse::failure(id, ResponseError::from_provider(error), self.clock.now_ms());
        self.queues.store_response(&processed).await
    }
}
