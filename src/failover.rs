//! Model availability and failover decision
//!
//! Before a call goes out, the decider picks where it goes: the requested model, the same tier
//! at the fallback provider, or (when neither is usable) the retry queue, in which case the
//! caller gets a [`RetryLaterSignal`] instead of a result.
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::availability::AvailabilityTracker;
use crate::clock::{Clock, millis};
use crate::errors::{AdmissionError, RetryLaterSignal};
use crate::queue_manager::QueueManager;
use crate::store::StoreError;
use crate::types::{ModelClassification, ModelKey, ModelRequest, RateLimitedRequest, RequestMetadata};

/// Delay suggested to callers before they first poll for a parked request.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Which providers serve a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverConfig {
    pub primary_provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_provider: Option<String>,
}

impl FailoverConfig {
    pub fn new(primary: impl Into<String>, fallback: Option<String>) -> Self {
        Self {
            primary_provider: primary.into(),
            fallback_provider: fallback,
        }
    }
}

/// Identifies the conversation turn a call belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallContext {
    pub chat_id: String,
    pub turn_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl CallContext {
    pub fn new(chat_id: impl Into<String>, turn_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            turn_id: turn_id.into(),
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Where a call should be executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Primary(ModelKey),
    Fallback(ModelKey),
}

impl Route {
    pub fn key(&self) -> &ModelKey {
        match self {
            Route::Primary(key) | Route::Fallback(key) => key,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Route::Fallback(_))
    }
}

#[derive(Debug, Clone)]
pub struct FailoverDecider {
    availability: Arc<AvailabilityTracker>,
    queues: QueueManager,
    clock: Arc<dyn Clock>,
    retry_delay: Duration,
}

impl FailoverDecider {
    pub fn new(
        availability: Arc<AvailabilityTracker>,
        queues: QueueManager,
        clock: Arc<dyn Clock>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            availability,
            queues,
            clock,
            retry_delay,
        }
    }

    pub fn availability(&self) -> &Arc<AvailabilityTracker> {
        &self.availability
    }

    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    /// Route a call for `current`, failing over or parking it when `current` is disabled.
    ///
    /// Returns `Err(AdmissionError::RetryLater)` once the request has been enqueued.
    #[instrument(skip(self, failover, call, request), fields(model = %current))]
    pub async fn check_model_availability_and_fallback(
        &self,
        current: &ModelKey,
        classification: ModelClassification,
        failover: &FailoverConfig,
        call: &CallContext,
        request: &ModelRequest,
    ) -> Result<Route, AdmissionError> {
        if self.availability.is_model_available(current) {
            return Ok(Route::Primary(current.clone()));
        }

        if let Some(fallback) = self.fallback_for(current, classification, failover) {
            info!(from = %current, to = %fallback, "Failing over to fallback provider");
            return Ok(Route::Fallback(fallback));
        }

        warn!("No provider available, parking request for a later retry");
        Err(self.enqueue_for_retry(classification, call, request).await?.into())
    }

    /// The fallback provider's key for `classification`, if configured, different from
    /// `current` and not disabled itself.
    pub fn fallback_for(
        &self,
        current: &ModelKey,
        classification: ModelClassification,
        failover: &FailoverConfig,
    ) -> Option<ModelKey> {
        let provider = failover.fallback_provider.as_deref()?;
        if provider == current.provider() {
            return None;
        }
        self.availability
            .get_available_model(provider, classification)
    }

    /// Park `request` in the first-generation queue and build the signal for the caller.
    pub async fn enqueue_for_retry(
        &self,
        classification: ModelClassification,
        call: &CallContext,
        request: &ModelRequest,
    ) -> Result<RetryLaterSignal, StoreError> {
        let now = self.clock.now_ms();
        let retry_after = now.saturating_add(millis(self.retry_delay));
        let parked = RateLimitedRequest {
            id: uuid::Uuid::new_v4().to_string(),
            model_classification: classification,
            request: request.clone(),
            metadata: RequestMetadata {
                chat_id: call.chat_id.clone(),
                turn_id: call.turn_id.clone(),
                user_id: call.user_id.clone(),
                submitted_at: now,
                retry_after: Some(retry_after),
                generation: 1,
            },
        };
        self.queues.enqueue_request(&parked).await?;

        Ok(RetryLaterSignal {
            chat_id: call.chat_id.clone(),
            turn_id: call.turn_id.clone(),
            retry_id: parked.id,
            retry_after,
        })
    }
}
