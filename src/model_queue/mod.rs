//! Per-model admission queue
//!
//! A [`LanguageModelQueue`] owns one concrete model. Callers enqueue a request and get a
//! [`QueueTicket`]; a scheduler ticking every [`LanguageModelQueueConfig::tick_interval`] decides
//! which pending entries may run, given the concurrency ceiling and the model's tracked token
//! capacity, and resolves the ticket once the call finished.
//!
//! ## Scheduling
//!
//! Each tick walks the pending entries in FIFO order. An entry runs when the tracked capacity can
//! absorb its token count. Otherwise it is skipped so that smaller requests behind it can pass,
//! unless it has been waiting longer than `stale_after`, in which case it runs regardless.
//!
//! ## Multiple instances
//!
//! The queue lives in the backing store and several processes may tick the same model. A process
//! only runs entries it holds a waiter for, but counts every processing entry against the
//! concurrency ceiling. Processing entries older than `processing_timeout` belong to an instance
//! that went away and are dropped. Pending entries no instance here is waiting on are dropped
//! once they are older than `pending_timeout`.
mod capacity;

pub use capacity::CAPACITY_WINDOW;

use bon::{Builder, bon};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::clock::{Clock, millis, system_clock};
use crate::errors::{AdmissionError, ProviderError};
use crate::store::{ENTRY_TTL, KeySpace, QueueBackend, StoreError};
use crate::traits::{
    HeuristicEstimator, MetricsSink, ModelClient, ModelStream, NoOpMetrics, TokenEstimator,
    estimate_or_fallback,
};
use crate::types::{
    ModelKey, ModelRequest, ModelResponse, QueueMethod, QueuedRequest, QueuedStatus,
};
use capacity::CapacityTracker;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_OUTPUT_RESERVE: u64 = 4096;
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 5;
/// Capacity stays zeroed this long after a rate limit that did not say when to come back.
pub const DEFAULT_RATE_LIMIT_RESET: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Builder)]
pub struct LanguageModelQueueConfig {
    pub model: ModelKey,
    pub tokens_per_minute: u64,
    pub requests_per_minute: Option<u64>,
    /// Tokens kept free for the model's output when validating a request.
    #[builder(default = DEFAULT_OUTPUT_RESERVE)]
    pub output_reserve: u64,
    #[builder(default = DEFAULT_MAX_CONCURRENT_REQUESTS)]
    pub max_concurrent_requests: usize,
    #[builder(default = DEFAULT_TICK_INTERVAL)]
    pub tick_interval: Duration,
    /// Pending entries older than this run even without capacity.
    #[builder(default = DEFAULT_STALE_AFTER)]
    pub stale_after: Duration,
    #[builder(default = DEFAULT_PROCESSING_TIMEOUT)]
    pub processing_timeout: Duration,
    /// Pending entries without a local waiter are dropped past this age.
    #[builder(default = DEFAULT_PENDING_TIMEOUT)]
    pub pending_timeout: Duration,
}

impl LanguageModelQueueConfig {
    /// The largest request that can ever be admitted.
    pub fn token_budget(&self) -> u64 {
        self.tokens_per_minute.saturating_sub(self.output_reserve)
    }
}

/// What a queued call produced.
pub enum QueueOutcome {
    Generated(ModelResponse),
    Streamed(ModelStream),
}

impl std::fmt::Debug for QueueOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueOutcome::Generated(response) => {
                f.debug_tuple("Generated").field(response).finish()
            }
            QueueOutcome::Streamed(_) => f.write_str("Streamed(..)"),
        }
    }
}

type Reply = Result<QueueOutcome, AdmissionError>;

/// Handle on a queued request, resolved by the scheduler.
#[derive(Debug)]
pub struct QueueTicket {
    id: String,
    model: String,
    rx: oneshot::Receiver<Reply>,
}

impl QueueTicket {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(self) -> Reply {
        self.rx
            .await
            .unwrap_or_else(|_| Err(AdmissionError::Disposed(self.model)))
    }
}

/// What a single scheduler pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Ids moved to processing, in the order they were picked.
    pub selected: Vec<String>,
    /// How many of `selected` were admitted for staleness rather than capacity.
    pub forced: usize,
    /// Pending entries passed over for lack of capacity.
    pub skipped: usize,
    /// Orphaned entries that were dropped, pending or processing.
    pub reclaimed: usize,
    pub pending: usize,
    pub processing: usize,
}

struct Inner {
    config: LanguageModelQueueConfig,
    model_type: String,
    queue_key: String,
    instance_id: String,
    client: Arc<dyn ModelClient>,
    backend: Arc<dyn QueueBackend>,
    estimator: Arc<dyn TokenEstimator>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    capacity: CapacityTracker,
    waiters: DashMap<String, oneshot::Sender<Reply>>,
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

#[derive(Clone)]
pub struct LanguageModelQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LanguageModelQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageModelQueue")
            .field("model", &self.inner.model_type)
            .field("instance_id", &self.inner.instance_id)
            .field("waiting", &self.inner.waiters.len())
            .finish()
    }
}

fn default_estimator() -> Arc<dyn TokenEstimator> {
    Arc::new(HeuristicEstimator)
}

fn default_metrics() -> Arc<dyn MetricsSink> {
    Arc::new(NoOpMetrics)
}

#[bon]
impl LanguageModelQueue {
    #[builder]
    pub fn new(
        config: LanguageModelQueueConfig,
        client: Arc<dyn ModelClient>,
        backend: Arc<dyn QueueBackend>,
        #[builder(default)] keys: KeySpace,
        #[builder(default = default_estimator())] estimator: Arc<dyn TokenEstimator>,
        #[builder(default = system_clock())] clock: Arc<dyn Clock>,
        #[builder(default = default_metrics())] metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let model_type = config.model.to_string();
        let capacity = CapacityTracker::new(
            Arc::clone(&backend),
            keys.capacity(&model_type),
            Arc::clone(&clock),
            config.tokens_per_minute,
            config.requests_per_minute,
        );
        Self {
            inner: Arc::new(Inner {
                queue_key: keys.model_queue(&model_type),
                model_type,
                instance_id: uuid::Uuid::new_v4().to_string(),
                config,
                client,
                backend,
                estimator,
                clock,
                metrics,
                capacity,
                waiters: DashMap::new(),
                shutdown: CancellationToken::new(),
                disposed: AtomicBool::new(false),
            }),
        }
    }
}

impl LanguageModelQueue {
    pub fn model(&self) -> &ModelKey {
        &self.inner.config.model
    }

    pub fn config(&self) -> &LanguageModelQueueConfig {
        &self.inner.config
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Validate and persist a request. The returned ticket resolves once the scheduler ran it.
    #[instrument(skip(self, request, user_id), fields(model = %self.inner.model_type))]
    pub async fn enqueue(
        &self,
        method: QueueMethod,
        request: ModelRequest,
        user_id: Option<String>,
    ) -> Result<QueueTicket, AdmissionError> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(AdmissionError::Disposed(inner.model_type.clone()));
        }

        let token_count = estimate_or_fallback(inner.estimator.as_ref(), &request);
        let budget = inner.config.token_budget();
        if token_count > budget {
            warn!(token_count, budget, "Request can never fit the model's budget");
            return Err(AdmissionError::Validation {
                model: inner.model_type.clone(),
                token_count,
                budget,
            });
        }

        let entry = QueuedRequest {
            id: uuid::Uuid::new_v4().to_string(),
            model_type: inner.model_type.clone(),
            method,
            params: request,
            token_count,
            user_id,
            status: QueuedStatus::Pending,
            queued_at: inner.clock.now_ms(),
            processing_started_at: None,
            processing_queue_instance_id: None,
        };
        let payload = serde_json::to_string(&entry).map_err(StoreError::from)?;

        // The waiter must exist before the entry becomes visible to a tick.
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(entry.id.clone(), tx);
        if let Err(e) = inner
            .backend
            .push_back(&inner.queue_key, payload, ENTRY_TTL)
            .await
        {
            inner.waiters.remove(&entry.id);
            return Err(e.into());
        }

        debug!(id = %entry.id, token_count, "Request queued");
        Ok(QueueTicket {
            id: entry.id,
            model: inner.model_type.clone(),
            rx,
        })
    }

    /// Enqueue and wait, giving up when `cancel` fires.
    pub async fn submit(
        &self,
        method: QueueMethod,
        request: ModelRequest,
        user_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Reply {
        let ticket = self.enqueue(method, request, user_id).await?;
        let id = ticket.id.clone();
        tokio::select! {
            reply = ticket.wait() => reply,
            _ = cancel.cancelled() => {
                self.cancel(&id).await?;
                Err(AdmissionError::Cancelled(id))
            }
        }
    }

    pub async fn generate(
        &self,
        request: ModelRequest,
        user_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, AdmissionError> {
        match self
            .submit(QueueMethod::Generate, request, user_id, cancel)
            .await?
        {
            QueueOutcome::Generated(response) => Ok(response),
            QueueOutcome::Streamed(_) => Err(self.mismatch("a stream")),
        }
    }

    pub async fn stream(
        &self,
        request: ModelRequest,
        user_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<ModelStream, AdmissionError> {
        match self
            .submit(QueueMethod::Stream, request, user_id, cancel)
            .await?
        {
            QueueOutcome::Streamed(stream) => Ok(stream),
            QueueOutcome::Generated(_) => Err(self.mismatch("a complete response")),
        }
    }

    fn mismatch(&self, got: &str) -> AdmissionError {
        AdmissionError::Provider(ProviderError::Upstream {
            model: self.inner.model_type.clone(),
            status: None,
            message: format!("queue produced {got} for the wrong call type"),
        })
    }

    /// Drop a request and reject its ticket. Safe to call more than once, and after completion.
    #[instrument(skip(self), fields(model = %self.inner.model_type))]
    pub async fn cancel(&self, id: &str) -> Result<bool, AdmissionError> {
        let had_waiter = self.settle(id, Err(AdmissionError::Cancelled(id.to_string())));
        let removed = self.remove_entry(id).await?;
        if had_waiter || removed {
            info!(id, removed, "Queued request cancelled");
        }
        Ok(had_waiter || removed)
    }

    /// All entries currently in this model's queue, head first.
    pub async fn entries(&self) -> Result<Vec<QueuedRequest>, StoreError> {
        Ok(self.load().await?.into_iter().map(|(_, e)| e).collect())
    }

    /// One scheduler pass.
    #[instrument(skip(self), fields(model = %self.inner.model_type))]
    pub async fn tick(&self) -> Result<TickReport, AdmissionError> {
        let inner = &self.inner;
        let mut report = TickReport::default();
        if inner.disposed.load(Ordering::SeqCst) {
            return Ok(report);
        }

        let now = inner.clock.now_ms();
        let timeout = millis(inner.config.processing_timeout);
        let mut pending = Vec::new();
        for (raw, entry) in self.load().await? {
            match entry.status {
                QueuedStatus::Pending
                    if !inner.waiters.contains_key(&entry.id)
                        && entry.age(now) > inner.config.pending_timeout =>
                {
                    warn!(
                        id = %entry.id,
                        waited_ms = now.saturating_sub(entry.queued_at),
                        "Dropping orphaned pending entry"
                    );
                    report.reclaimed += inner.backend.remove_value(&inner.queue_key, &raw).await?;
                }
                QueuedStatus::Pending => pending.push((raw, entry)),
                QueuedStatus::Processing => {
                    let started = entry.processing_started_at.unwrap_or(entry.queued_at);
                    if now.saturating_sub(started) <= timeout {
                        report.processing += 1;
                        continue;
                    }
                    warn!(
                        id = %entry.id,
                        instance = ?entry.processing_queue_instance_id,
                        "Dropping orphaned processing entry"
                    );
                    report.reclaimed += inner.backend.remove_value(&inner.queue_key, &raw).await?;
                    self.settle(
                        &entry.id,
                        Err(AdmissionError::Provider(ProviderError::Upstream {
                            model: inner.model_type.clone(),
                            status: None,
                            message: "request timed out while processing".into(),
                        })),
                    );
                }
            }
        }
        report.pending = pending.len();
        inner
            .metrics
            .record_queue_size(&inner.queue_key, report.pending + report.processing);

        let slots = inner
            .config
            .max_concurrent_requests
            .saturating_sub(report.processing);
        if slots == 0 || pending.is_empty() {
            trace!(slots, pending = report.pending, "Nothing to schedule");
            return Ok(report);
        }

        let mut budget = inner.capacity.current().await?;
        for (raw, entry) in pending {
            if report.selected.len() >= slots {
                break;
            }
            if !inner.waiters.contains_key(&entry.id) {
                continue;
            }

            let forced = if budget.has_capacity(entry.token_count, now) {
                budget.consume(entry.token_count);
                false
            } else if entry.age(now) > inner.config.stale_after {
                true
            } else {
                report.skipped += 1;
                continue;
            };

            let mut claimed = entry;
            claimed.status = QueuedStatus::Processing;
            claimed.processing_started_at = Some(now);
            claimed.processing_queue_instance_id = Some(inner.instance_id.clone());
            let claimed_raw = serde_json::to_string(&claimed).map_err(StoreError::from)?;
            if !inner
                .backend
                .replace_value(&inner.queue_key, &raw, claimed_raw.clone())
                .await?
            {
                debug!(id = %claimed.id, "Entry changed under us, leaving it");
                continue;
            }

            if forced {
                report.forced += 1;
                info!(
                    id = %claimed.id,
                    waited_ms = now.saturating_sub(claimed.queued_at),
                    "Force-admitting stale request"
                );
            }
            report.selected.push(claimed.id.clone());

            let queue = self.clone();
            tokio::spawn(async move { queue.execute(claimed, claimed_raw, forced).await });
        }

        if !report.selected.is_empty() {
            debug!(
                selected = report.selected.len(),
                skipped = report.skipped,
                "Scheduled requests"
            );
        }
        Ok(report)
    }

    /// Run the scheduler on its own task until [`Self::dispose`] is called.
    pub fn start(&self) -> JoinHandle<()> {
        let queue = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.config.tick_interval;
        info!(
            model = %self.inner.model_type,
            tick_ms = millis(period),
            "Starting queue scheduler"
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = queue.tick().await {
                            error!(model = %queue.inner.model_type, error = %e, "Queue tick failed");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!(model = %queue.inner.model_type, "Queue scheduler stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the scheduler, reject every outstanding ticket and drop this instance's entries.
    ///
    /// Returns how many stored entries were removed. Later calls do nothing.
    #[instrument(skip(self), fields(model = %self.inner.model_type))]
    pub async fn dispose(&self) -> Result<usize, AdmissionError> {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        inner.shutdown.cancel();

        let ids: Vec<String> = inner.waiters.iter().map(|w| w.key().clone()).collect();
        for id in &ids {
            self.settle(id, Err(AdmissionError::Disposed(inner.model_type.clone())));
        }

        let mut removed = 0;
        for (raw, entry) in self.load().await? {
            let ours = ids.contains(&entry.id)
                || entry.processing_queue_instance_id.as_deref() == Some(inner.instance_id.as_str());
            if ours {
                removed += inner.backend.remove_value(&inner.queue_key, &raw).await?;
            }
        }
        info!(rejected = ids.len(), removed, "Queue disposed");
        Ok(removed)
    }

    async fn load(&self) -> Result<Vec<(String, QueuedRequest)>, StoreError> {
        self.inner
            .backend
            .range(&self.inner.queue_key)
            .await?
            .into_iter()
            .map(|raw| {
                let entry = serde_json::from_str(&raw)?;
                Ok((raw, entry))
            })
            .collect()
    }

    async fn remove_entry(&self, id: &str) -> Result<bool, StoreError> {
        let mut removed = false;
        for (raw, entry) in self.load().await? {
            if entry.id == id {
                removed |= self
                    .inner
                    .backend
                    .remove_value(&self.inner.queue_key, &raw)
                    .await?
                    > 0;
            }
        }
        Ok(removed)
    }

    /// Hand `reply` to the waiter for `id`, if it is still around.
    fn settle(&self, id: &str, reply: Reply) -> bool {
        match self.inner.waiters.remove(id) {
            Some((_, tx)) => {
                // The receiver may have given up already.
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Put a processing entry back to pending.
    async fn release(&self, entry: &QueuedRequest, raw: &str) -> Result<(), StoreError> {
        let mut released = entry.clone();
        released.status = QueuedStatus::Pending;
        released.processing_started_at = None;
        released.processing_queue_instance_id = None;
        let payload = serde_json::to_string(&released)?;
        if !self
            .inner
            .backend
            .replace_value(&self.inner.queue_key, raw, payload)
            .await?
        {
            debug!(id = %entry.id, "Entry vanished before it could be released");
        }
        Ok(())
    }

    async fn execute(&self, entry: QueuedRequest, raw: String, forced: bool) {
        let id = entry.id.clone();
        if let Err(e) = self.run(entry, raw, forced).await {
            error!(model = %self.inner.model_type, id = %id, error = %e, "Store failure while running queued request");
            self.settle(&id, Err(e.into()));
        }
    }

    async fn run(&self, entry: QueuedRequest, raw: String, forced: bool) -> Result<(), StoreError> {
        let inner = &self.inner;
        let model = &inner.config.model;

        // Another instance may have hit a rate limit since this entry was picked.
        if !forced
            && inner
                .capacity
                .current()
                .await?
                .is_blocked(inner.clock.now_ms())
        {
            debug!(id = %entry.id, "Capacity zeroed since selection, returning entry to pending");
            return self.release(&entry, &raw).await;
        }
        inner.capacity.consume(entry.token_count).await?;

        inner.metrics.record_attempt(model);
        let started = Instant::now();
        let result = match entry.method {
            QueueMethod::Generate => inner
                .client
                .generate(model, &entry.params)
                .await
                .map(QueueOutcome::Generated),
            QueueMethod::Stream => inner
                .client
                .stream(model, &entry.params)
                .await
                .map(QueueOutcome::Streamed),
        };

        match result {
            Ok(outcome) => {
                inner.metrics.record_duration(model, started.elapsed());
                let snapshot = match &outcome {
                    QueueOutcome::Generated(response) => response.rate_limit,
                    QueueOutcome::Streamed(_) => None,
                };
                // Off the queue before the waiter sees the outcome.
                inner.backend.remove_value(&inner.queue_key, &raw).await?;
                self.settle(&entry.id, Ok(outcome));
                if let Some(snapshot) = snapshot {
                    inner.capacity.refresh(&snapshot).await?;
                }
                debug!(id = %entry.id, elapsed_ms = started.elapsed().as_millis() as u64, "Queued request completed");
            }
            Err(ProviderError::RateLimited { retry_after, .. }) => {
                inner.metrics.record_error(model, "rate_limit");
                let wait = retry_after.unwrap_or(DEFAULT_RATE_LIMIT_RESET);
                let reset_at = inner.clock.now_ms().saturating_add(millis(wait));
                warn!(id = %entry.id, reset_at, "Rate limited, returning entry to pending");
                inner.capacity.block_until(reset_at).await?;
                self.release(&entry, &raw).await?;
            }
            Err(other) => {
                inner.metrics.record_error(model, other.kind());
                warn!(id = %entry.id, error = %other, "Queued request failed");
                inner.backend.remove_value(&inner.queue_key, &raw).await?;
                self.settle(&entry.id, Err(other.into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryBackend;
    use crate::test_utils::{FlakyBackend, MockModelClient, MockOutcome, settle_tasks};
    use crate::types::{Message, ModelCapacity, ModelClassification};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    /// Holds every generate call until the test adds a permit to `gate`.
    #[derive(Debug)]
    struct GatedClient {
        gate: Semaphore,
        calls: AtomicUsize,
    }

    impl GatedClient {
        fn new() -> Self {
            Self {
                gate: Semaphore::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelClient for GatedClient {
        async fn generate(
            &self,
            model: &ModelKey,
            _request: &ModelRequest,
        ) -> Result<ModelResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await.map_err(|e| ProviderError::Upstream {
                model: model.to_string(),
                status: None,
                message: e.to_string(),
            })?;
            Ok(ModelResponse {
                model: model.to_string(),
                content: "late".into(),
                usage: None,
                rate_limit: None,
            })
        }

        async fn stream(
            &self,
            model: &ModelKey,
            _request: &ModelRequest,
        ) -> Result<ModelStream, ProviderError> {
            Err(ProviderError::Upstream {
                model: model.to_string(),
                status: None,
                message: "streaming is not gated".into(),
            })
        }
    }

    struct Fixture {
        queue: LanguageModelQueue,
        client: Arc<MockModelClient>,
        backend: Arc<MemoryBackend>,
        clock: Arc<ManualClock>,
    }

    fn model() -> ModelKey {
        ModelKey::new("openai", ModelClassification::HighFidelity)
    }

    fn queue_over(
        max_concurrent: usize,
        client: Arc<dyn ModelClient>,
        backend: Arc<dyn QueueBackend>,
        clock: Arc<ManualClock>,
    ) -> LanguageModelQueue {
        let config = LanguageModelQueueConfig::builder()
            .model(model())
            .tokens_per_minute(10_000)
            .output_reserve(1_000)
            .max_concurrent_requests(max_concurrent)
            .build();
        LanguageModelQueue::builder()
            .config(config)
            .client(client)
            .backend(backend)
            .clock(clock)
            .build()
    }

    fn fixture_with(max_concurrent: usize) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let backend = Arc::new(MemoryBackend::with_clock(clock.clone()));
        let client = Arc::new(MockModelClient::new());
        let queue = queue_over(max_concurrent, client.clone(), backend.clone(), clock.clone());
        Fixture {
            queue,
            client,
            backend,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(5)
    }

    /// A request estimated at `tokens` tokens by the heuristic estimator.
    fn request_of(tokens: u64) -> ModelRequest {
        let chars = (tokens - 4) * 4;
        ModelRequest::new(vec![Message::user("x".repeat(chars as usize))])
    }

    async fn set_capacity(f: &Fixture, capacity: ModelCapacity) {
        f.backend
            .set(
                &KeySpace::default().capacity(&model().to_string()),
                serde_json::to_string(&capacity).unwrap(),
                ENTRY_TTL,
            )
            .await
            .unwrap();
    }

    fn statuses(entries: &[QueuedRequest]) -> Vec<QueuedStatus> {
        entries.iter().map(|e| e.status).collect()
    }

    #[tokio::test]
    async fn test_oversized_request_is_rejected_without_persisting() {
        let f = fixture();
        let err = f
            .queue
            .enqueue(QueueMethod::Generate, request_of(9_001), None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AdmissionError::Validation { token_count: 9_001, budget: 9_000, .. }
        ));
        assert!(f.queue.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_at_budget_is_accepted() {
        let f = fixture();
        f.queue
            .enqueue(QueueMethod::Generate, request_of(9_000), Some("user".into()))
            .await
            .unwrap();

        let entries = f.queue.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].token_count, 9_000);
        assert_eq!(entries[0].status, QueuedStatus::Pending);
        assert_eq!(entries[0].user_id.as_deref(), Some("user"));
        assert_eq!(entries[0].model_type, "openai:high-fidelity");
    }

    #[tokio::test]
    async fn test_tick_runs_request_and_resolves_ticket() {
        let f = fixture();
        f.client.respond(&model(), MockOutcome::text("done"));

        let ticket = f
            .queue
            .enqueue(QueueMethod::Generate, request_of(100), None)
            .await
            .unwrap();
        let report = f.queue.tick().await.unwrap();
        assert_eq!(report.selected, vec![ticket.id().to_string()]);

        match ticket.wait().await.unwrap() {
            QueueOutcome::Generated(response) => assert_eq!(response.content, "done"),
            other => panic!("unexpected outcome {other:?}"),
        }
        settle_tasks().await;
        assert!(f.queue.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fifo_order_without_capacity_pressure() {
        let f = fixture_with(1);
        f.client.respond(&model(), MockOutcome::text("ok"));

        let first = f
            .queue
            .enqueue(QueueMethod::Generate, request_of(100), None)
            .await
            .unwrap();
        let second = f
            .queue
            .enqueue(QueueMethod::Generate, request_of(100), None)
            .await
            .unwrap();

        let report = f.queue.tick().await.unwrap();
        assert_eq!(report.selected, vec![first.id().to_string()]);
        first.wait().await.unwrap();
        settle_tasks().await;

        let report = f.queue.tick().await.unwrap();
        assert_eq!(report.selected, vec![second.id().to_string()]);
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_limits_selection() {
        let f = fixture_with(2);
        f.client.respond(&model(), MockOutcome::Hang);

        for _ in 0..3 {
            f.queue
                .enqueue(QueueMethod::Generate, request_of(100), None)
                .await
                .unwrap();
        }

        let report = f.queue.tick().await.unwrap();
        assert_eq!(report.selected.len(), 2);
        let entries = f.queue.entries().await.unwrap();
        assert_eq!(
            statuses(&entries),
            vec![
                QueuedStatus::Processing,
                QueuedStatus::Processing,
                QueuedStatus::Pending
            ]
        );

        let report = f.queue.tick().await.unwrap();
        assert!(report.selected.is_empty());
        assert_eq!(report.processing, 2);
    }

    #[tokio::test]
    async fn test_small_request_passes_capacity_blocked_large_one() {
        let f = fixture();
        f.client.respond(&model(), MockOutcome::Hang);
        set_capacity(&f, ModelCapacity::full(500, None, f.clock.now_ms())).await;

        let large = f
            .queue
            .enqueue(QueueMethod::Generate, request_of(2_000), None)
            .await
            .unwrap();
        let small = f
            .queue
            .enqueue(QueueMethod::Generate, request_of(100), None)
            .await
            .unwrap();

        let report = f.queue.tick().await.unwrap();
        assert_eq!(report.selected, vec![small.id().to_string()]);
        assert_eq!(report.skipped, 1);

        let entries = f.queue.entries().await.unwrap();
        let large_entry = entries.iter().find(|e| e.id == large.id()).unwrap();
        assert_eq!(large_entry.status, QueuedStatus::Pending);
    }

    #[tokio::test]
    async fn test_stale_request_is_force_admitted() {
        let f = fixture();
        f.client.respond(&model(), MockOutcome::Hang);
        let now = f.clock.now_ms();
        set_capacity(&f, ModelCapacity::exhausted(now, now + 60 * 60 * 1000)).await;

        let ticket = f
            .queue
            .enqueue(QueueMethod::Generate, request_of(100), None)
            .await
            .unwrap();
        let report = f.queue.tick().await.unwrap();
        assert!(report.selected.is_empty());
        assert_eq!(report.skipped, 1);

        f.clock.advance(DEFAULT_STALE_AFTER + Duration::from_secs(1));
        let report = f.queue.tick().await.unwrap();
        assert_eq!(report.selected, vec![ticket.id().to_string()]);
        assert_eq!(report.forced, 1);

        settle_tasks().await;
        assert_eq!(f.client.calls(), vec![model()]);
    }

    #[tokio::test]
    async fn test_rate_limit_returns_entry_to_pending_and_zeroes_capacity() {
        let f = fixture();
        f.client.respond(
            &model(),
            MockOutcome::rate_limited(Some(Duration::from_secs(30))),
        );
        f.client.respond(&model(), MockOutcome::text("second time lucky"));

        let ticket = f
            .queue
            .enqueue(QueueMethod::Generate, request_of(100), None)
            .await
            .unwrap();
        f.queue.tick().await.unwrap();
        settle_tasks().await;

        let entries = f.queue.entries().await.unwrap();
        assert_eq!(statuses(&entries), vec![QueuedStatus::Pending]);
        assert_eq!(entries[0].processing_queue_instance_id, None);

        let report = f.queue.tick().await.unwrap();
        assert!(report.selected.is_empty());
        assert_eq!(report.skipped, 1);

        f.clock.advance(Duration::from_secs(31));
        let report = f.queue.tick().await.unwrap();
        assert_eq!(report.selected.len(), 1);
        match ticket.wait().await.unwrap() {
            QueueOutcome::Generated(response) => assert_eq!(response.content, "second time lucky"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_other_failure_rejects_ticket_and_removes_entry() {
        let f = fixture();
        f.client.respond(
            &model(),
            MockOutcome::Fail(ProviderError::Rejected {
                model: model().to_string(),
                status: Some(400),
                message: "bad request".into(),
            }),
        );

        let ticket = f
            .queue
            .enqueue(QueueMethod::Generate, request_of(100), None)
            .await
            .unwrap();
        f.queue.tick().await.unwrap();

        let err = ticket.wait().await.unwrap_err();
        assert!(matches!(err, AdmissionError::Provider(ProviderError::Rejected { .. })));
        settle_tasks().await;
        assert!(f.queue.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_pickup() {
        let f = fixture();
        let ticket = f
            .queue
            .enqueue(QueueMethod::Generate, request_of(100), None)
            .await
            .unwrap();
        let id = ticket.id().to_string();

        assert!(f.queue.cancel(&id).await.unwrap());
        assert!(matches!(
            ticket.wait().await.unwrap_err(),
            AdmissionError::Cancelled(cancelled) if cancelled == id
        ));
        assert!(f.queue.entries().await.unwrap().is_empty());

        assert!(!f.queue.cancel(&id).await.unwrap());
        assert!(f.queue.tick().await.unwrap().selected.is_empty());
    }

    #[tokio::test]
    async fn test_submit_honours_cancellation_token() {
        let f = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f
            .queue
            .submit(QueueMethod::Generate, request_of(100), None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Cancelled(_)));
        assert!(f.queue.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispose_rejects_outstanding_tickets() {
        let f = fixture();
        let ticket = f
            .queue
            .enqueue(QueueMethod::Generate, request_of(100), None)
            .await
            .unwrap();

        assert_eq!(f.queue.dispose().await.unwrap(), 1);
        assert!(matches!(
            ticket.wait().await.unwrap_err(),
            AdmissionError::Disposed(_)
        ));
        assert!(f.queue.entries().await.unwrap().is_empty());

        let err = f
            .queue
            .enqueue(QueueMethod::Generate, request_of(100), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Disposed(_)));
        assert_eq!(f.queue.dispose().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_orphaned_processing_entries_are_dropped() {
        let f = fixture();
        let orphan = QueuedRequest {
            id: "orphan".into(),
            model_type: model().to_string(),
            method: QueueMethod::Generate,
            params: request_of(100),
            token_count: 100,
            user_id: None,
            status: QueuedStatus::Processing,
            queued_at: f.clock.now_ms(),
            processing_started_at: Some(f.clock.now_ms()),
            processing_queue_instance_id: Some("gone".into()),
        };
        f.backend
            .push_back(
                &KeySpace::default().model_queue(&model().to_string()),
                serde_json::to_string(&orphan).unwrap(),
                ENTRY_TTL,
            )
            .await
            .unwrap();

        let report = f.queue.tick().await.unwrap();
        assert_eq!(report.processing, 1);
        assert_eq!(report.reclaimed, 0);

        f.clock
            .advance(DEFAULT_PROCESSING_TIMEOUT + Duration::from_secs(1));
        let report = f.queue.tick().await.unwrap();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.processing, 0);
        assert!(f.queue.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_entries_without_local_waiter_are_left_alone_until_abandoned() {
        let f = fixture_with(0);
        f.client.respond(&model(), MockOutcome::text("ok"));
        let foreign = QueuedRequest {
            id: "foreign".into(),
            model_type: model().to_string(),
            method: QueueMethod::Generate,
            params: request_of(100),
            token_count: 100,
            user_id: None,
            status: QueuedStatus::Pending,
            queued_at: f.clock.now_ms(),
            processing_started_at: None,
            processing_queue_instance_id: None,
        };
        f.backend
            .push_back(
                &KeySpace::default().model_queue(&model().to_string()),
                serde_json::to_string(&foreign).unwrap(),
                ENTRY_TTL,
            )
            .await
            .unwrap();
        let local = f
            .queue
            .enqueue(QueueMethod::Generate, request_of(100), None)
            .await
            .unwrap();

        let report = f.queue.tick().await.unwrap();
        assert!(report.selected.is_empty());
        assert_eq!(report.pending, 2);
        assert_eq!(report.reclaimed, 0);
        assert!(f.client.calls().is_empty());

        // Nobody will ever wait on the foreign entry; the local one still has a waiter.
        f.clock
            .advance(DEFAULT_PENDING_TIMEOUT + Duration::from_secs(1));
        let report = f.queue.tick().await.unwrap();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.pending, 1);

        let entries = f.queue.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, local.id());
    }

    #[tokio::test]
    async fn test_entry_is_gone_once_ticket_resolves() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let backend = Arc::new(FlakyBackend::new(MemoryBackend::with_clock(clock.clone())));
        let client = Arc::new(MockModelClient::new());
        client.respond(&model(), MockOutcome::text("done"));
        let queue = queue_over(5, client, backend, clock);

        let ticket = queue
            .enqueue(QueueMethod::Generate, request_of(100), None)
            .await
            .unwrap();
        queue.tick().await.unwrap();

        match ticket.wait().await.unwrap() {
            QueueOutcome::Generated(response) => assert_eq!(response.content, "done"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(queue.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_removal_is_reported_to_the_waiter() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let backend = Arc::new(FlakyBackend::new(MemoryBackend::with_clock(clock.clone())));
        let client = Arc::new(MockModelClient::new());
        client.respond(&model(), MockOutcome::text("done"));
        let queue = queue_over(5, client, backend.clone(), clock);

        let ticket = queue
            .enqueue(QueueMethod::Generate, request_of(100), None)
            .await
            .unwrap();
        backend.fail_removals(true);
        queue.tick().await.unwrap();

        assert!(matches!(
            ticket.wait().await,
            Err(AdmissionError::Store(StoreError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_cancel_while_processing_discards_late_result() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let client = Arc::new(GatedClient::new());
        let backend = Arc::new(MemoryBackend::with_clock(clock.clone()));
        let queue = queue_over(5, client.clone(), backend, clock);

        let ticket = queue
            .enqueue(QueueMethod::Generate, request_of(100), None)
            .await
            .unwrap();
        let id = ticket.id().to_string();
        queue.tick().await.unwrap();
        settle_tasks().await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            statuses(&queue.entries().await.unwrap()),
            vec![QueuedStatus::Processing]
        );

        assert!(queue.cancel(&id).await.unwrap());
        assert!(matches!(
            ticket.wait().await,
            Err(AdmissionError::Cancelled(cancelled)) if cancelled == id
        ));
        assert!(queue.entries().await.unwrap().is_empty());

        // The call returns after the caller left.
        client.gate.add_permits(1);
        settle_tasks().await;
        assert!(queue.entries().await.unwrap().is_empty());
        assert!(!queue.cancel(&id).await.unwrap());

        let report = queue.tick().await.unwrap();
        assert!(report.selected.is_empty());
        assert_eq!(report.pending + report.processing, 0);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_task_resolves_requests() {
        let f = fixture();
        f.client.respond(&model(), MockOutcome::text("scheduled"));
        let handle = f.queue.start();

        let response = f
            .queue
            .generate(request_of(100), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.content, "scheduled");

        f.queue.dispose().await.unwrap();
        handle.await.unwrap();
    }
}
