//! Pass-through wrapper for streamed responses
//!
//! Chunks are forwarded unchanged, except that an in-band rate-limit error gets the retry-later
//! signal attached after the model was disabled and the request parked. If parking fails, a
//! [`StreamChunk::StoreFailure`] follows the error chunk. The stream is never cut short: the
//! error chunk and anything after it still reach the caller.
use futures_util::StreamExt;
use futures_util::stream;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

use crate::availability::MIN_DISABLE_DURATION;
use crate::errors::{ProviderError, RetryLaterSignal};
use crate::failover::{CallContext, FailoverDecider};
use crate::store::StoreError;
use crate::traits::{MetricsSink, ModelStream};
use crate::types::{ModelClassification, ModelKey, ModelRequest, StreamChunk};

/// Everything needed to park a request whose stream failed mid-flight.
pub(crate) struct InBandHandler {
    pub(crate) decider: FailoverDecider,
    pub(crate) model: ModelKey,
    pub(crate) classification: ModelClassification,
    pub(crate) call: CallContext,
    pub(crate) request: ModelRequest,
    pub(crate) metrics: Arc<dyn MetricsSink>,
}

impl InBandHandler {
    async fn on_error(
        &self,
        error: &ProviderError,
    ) -> Result<Option<RetryLaterSignal>, StoreError> {
        self.metrics.record_error(&self.model, error.kind());
        let ProviderError::RateLimited { retry_after, .. } = error else {
            return Ok(None);
        };

        self.decider.availability().temporarily_disable_model(
            &self.model,
            retry_after.unwrap_or(MIN_DISABLE_DURATION),
        );
        self.decider
            .enqueue_for_retry(self.classification, &self.call, &self.request)
            .await
            .map(Some)
            .inspect_err(|e| {
                error!(model = %self.model, error = %e, "Failed to park rate-limited stream");
            })
    }
}

struct State {
    inner: ModelStream,
    handler: Arc<InBandHandler>,
    /// Emitted before the next chunk of `inner`.
    queued: Option<StreamChunk>,
    text: String,
    started: Instant,
}

/// Wrap `inner` so in-band rate limits are handled like one-shot ones.
pub(crate) fn rate_limit_aware(inner: ModelStream, handler: Arc<InBandHandler>) -> ModelStream {
    let state = State {
        inner,
        handler,
        queued: None,
        text: String::new(),
        started: Instant::now(),
    };

    stream::unfold(state, |mut state| async move {
        if let Some(chunk) = state.queued.take() {
            return Some((chunk, state));
        }
        let chunk = state.inner.next().await?;
        let chunk = match chunk {
            StreamChunk::TextDelta(delta) => {
                state.text.push_str(&delta);
                StreamChunk::TextDelta(delta)
            }
            StreamChunk::Error { error, retry } => {
                warn!(
                    model = %state.handler.model,
                    error = %error,
                    received_chars = state.text.len(),
                    "Stream reported an error"
                );
                let retry = match retry {
                    Some(signal) => Some(signal),
                    None => match state.handler.on_error(&error).await {
                        Ok(signal) => signal,
                        Err(e) => {
                            state.queued = Some(StreamChunk::StoreFailure(e));
                            None
                        }
                    },
                };
                StreamChunk::Error { error, retry }
            }
            StreamChunk::StoreFailure(e) => StreamChunk::StoreFailure(e),
            StreamChunk::Finish { usage } => {
                let handler = &state.handler;
                handler
                    .metrics
                    .record_duration(&handler.model, state.started.elapsed());
                debug!(
                    model = %handler.model,
                    chars = state.text.len(),
                    "Stream finished"
                );
                StreamChunk::Finish { usage }
            }
        };
        Some((chunk, state))
    })
    .boxed()
}
