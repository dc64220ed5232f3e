//! Caller-side polling for parked requests
//!
//! A caller that received a [`RetryLaterSignal`] hands it to [`RetryPoller::wait_for_response`],
//! which sleeps until the hinted time (never less than the backoff floor) and then looks the
//! request up in the response store, a bounded number of times.
use bon::Builder;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::errors::{AdmissionError, RetryLaterSignal};
use crate::queue_manager::QueueManager;
use crate::types::ProcessedResponse;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// The store is never polled more often than this.
pub const MIN_POLL_BACKOFF: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Builder)]
pub struct RetryPollerConfig {
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,
    #[builder(default = MIN_POLL_BACKOFF)]
    pub min_backoff: Duration,
}

impl Default for RetryPollerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone)]
pub struct RetryPoller {
    queues: QueueManager,
    clock: Arc<dyn Clock>,
    config: RetryPollerConfig,
}

impl RetryPoller {
    pub fn new(queues: QueueManager, clock: Arc<dyn Clock>, config: RetryPollerConfig) -> Self {
        Self {
            queues,
            clock,
            config,
        }
    }

    fn backoff(&self, retry_after: u64) -> Duration {
        let hinted = Duration::from_millis(retry_after.saturating_sub(self.clock.now_ms()));
        hinted.max(self.config.min_backoff)
    }

    /// Wait for the outcome of the parked request behind `signal`.
    pub async fn wait_for_response(
        &self,
        signal: &RetryLaterSignal,
    ) -> Result<ProcessedResponse, AdmissionError> {
        self.wait_for_response_with_cancel(signal, &CancellationToken::new())
            .await
    }

    /// Like [`Self::wait_for_response`]. When `cancel` fires, the parked request is dropped from
    /// its queue and `AdmissionError::Cancelled` is returned.
    #[instrument(skip(self, signal, cancel), fields(retry_id = %signal.retry_id))]
    pub async fn wait_for_response_with_cancel(
        &self,
        signal: &RetryLaterSignal,
        cancel: &CancellationToken,
    ) -> Result<ProcessedResponse, AdmissionError> {
        for attempt in 1..=self.config.max_retries {
            let delay = self.backoff(signal.retry_after);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Waiting before polling");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    let removed = self.queues.remove_request(&signal.retry_id).await?;
                    info!(removed, "Stopped waiting for parked request");
                    return Err(AdmissionError::Cancelled(signal.retry_id.clone()));
                }
            }

            if let Some(response) = self.queues.get_response(&signal.retry_id).await? {
                info!(attempt, success = response.is_success(), "Parked request has an outcome");
                return Ok(response);
            }
        }

        warn!(attempts = self.config.max_retries, "Gave up waiting for parked request");
        Err(AdmissionError::MaxRetriesExceeded {
            retry_id: signal.retry_id.clone(),
            attempts: self.config.max_retries,
        })
    }
}
