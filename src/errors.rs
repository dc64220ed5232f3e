//! Error taxonomy
//!
//! Provider failures are classified once, where the provider response is decoded, into
//! [`ProviderError`]. Everything downstream matches on the variant instead of re-inspecting
//! the payload. A call that was refused or lost by the gateway itself (a full queue, a store
//! outage, a cancellation) travels through a [`ModelClient`](crate::traits::ModelClient) as
//! [`ProviderError::Admission`] and is unwrapped back into its [`AdmissionError`] on the way out.
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::store::StoreError;

/// A failure reported by (or on the way to) a model provider.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    /// The provider signalled backpressure.
    #[error("rate limited by {model}: {message}")]
    RateLimited {
        model: String,
        message: String,
        retry_after: Option<Duration>,
    },

    /// The request can never succeed as sent (bad parameters, too large, ...).
    #[error("request rejected by {model}: {message}")]
    Rejected {
        model: String,
        status: Option<u16>,
        message: String,
    },

    /// Any other provider or transport failure.
    #[error("provider error from {model}: {message}")]
    Upstream {
        model: String,
        status: Option<u16>,
        message: String,
    },

    /// The call never reached a provider.
    #[error(transparent)]
    Admission(Box<AdmissionError>),
}

impl ProviderError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short machine-readable label, used for metrics and stored failures.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::RateLimited { .. } => "rate_limit",
            ProviderError::Rejected { .. } => "rejected",
            ProviderError::Upstream { .. } => "provider_error",
            ProviderError::Admission(error) => error.kind(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::RateLimited { .. } => Some(429),
            ProviderError::Rejected { status, .. } | ProviderError::Upstream { status, .. } => {
                *status
            }
            ProviderError::Admission(_) => None,
        }
    }
}

/// Returned instead of a result when a request was parked in a retry queue.
///
/// The caller keeps `retry_id` and polls the response store once `retry_after` (epoch millis)
/// has passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("request {retry_id} was queued for a later retry (chat {chat_id}, turn {turn_id})")]
pub struct RetryLaterSignal {
    pub chat_id: String,
    pub turn_id: String,
    pub retry_id: String,
    pub retry_after: u64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdmissionError {
    /// The request exceeds any budget the model could ever grant. Never retried, never queued.
    #[error(
        "request for {model} needs {token_count} tokens but at most {budget} tokens fit in a minute"
    )]
    Validation {
        model: String,
        token_count: u64,
        budget: u64,
    },

    #[error(transparent)]
    RetryLater(RetryLaterSignal),

    #[error(transparent)]
    Provider(ProviderError),

    #[error("backing store failure: {0}")]
    Store(#[from] StoreError),

    #[error("request {0} was cancelled")]
    Cancelled(String),

    #[error("queue for {0} was disposed")]
    Disposed(String),

    #[error("gave up waiting for request {retry_id} after {attempts} attempts")]
    MaxRetriesExceeded { retry_id: String, attempts: u32 },

    #[error("no classification known for model {0}")]
    UnknownModel(String),
}

impl From<ProviderError> for AdmissionError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::Admission(inner) => *inner,
            other => AdmissionError::Provider(other),
        }
    }
}

impl From<AdmissionError> for ProviderError {
    fn from(error: AdmissionError) -> Self {
        match error {
            AdmissionError::Provider(inner) => inner,
            other => ProviderError::Admission(Box::new(other)),
        }
    }
}

impl From<RetryLaterSignal> for AdmissionError {
    fn from(signal: RetryLaterSignal) -> Self {
        AdmissionError::RetryLater(signal)
    }
}

impl AdmissionError {
    /// Short machine-readable label, used for metrics and error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionError::Validation { .. } => "validation",
            AdmissionError::RetryLater(_) => "retry_later",
            AdmissionError::Provider(error) => error.kind(),
            AdmissionError::Store(_) => "store_error",
            AdmissionError::Cancelled(_) => "cancelled",
            AdmissionError::Disposed(_) => "disposed",
            AdmissionError::MaxRetriesExceeded { .. } => "max_retries_exceeded",
            AdmissionError::UnknownModel(_) => "unknown_model",
        }
    }

    pub fn retry_signal(&self) -> Option<&RetryLaterSignal> {
        match self {
            AdmissionError::RetryLater(signal) => Some(signal),
            _ => None,
        }
    }
}
