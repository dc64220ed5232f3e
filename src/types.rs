//! Data model shared by the queues, the failover logic and the HTTP surface.
//!
//! Everything that is persisted in the backing store is serialized as camelCase JSON.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ProviderError;

/// A coarse quota tier that abstracts a concrete provider model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum ModelClassification {
    HighFidelity,
    LowFidelity,
    Completion,
    Embedding,
}

impl ModelClassification {
    pub const ALL: [ModelClassification; 4] = [
        ModelClassification::HighFidelity,
        ModelClassification::LowFidelity,
        ModelClassification::Completion,
        ModelClassification::Embedding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelClassification::HighFidelity => "high-fidelity",
            ModelClassification::LowFidelity => "low-fidelity",
            ModelClassification::Completion => "completion",
            ModelClassification::Embedding => "embedding",
        }
    }
}

impl fmt::Display for ModelClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelClassification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelClassification::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown model classification: {s}"))
    }
}

/// Identity of a model for quota purposes: `provider:classification`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelKey {
    provider: String,
    classification: ModelClassification,
}

impl ModelKey {
    pub fn new(provider: impl Into<String>, classification: ModelClassification) -> Self {
        Self {
            provider: provider.into(),
            classification,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn classification(&self) -> ModelClassification {
        self.classification
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.classification)
    }
}

impl FromStr for ModelKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (provider, classification) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("model key must look like provider:classification, got {s}"))?;
        if provider.is_empty() {
            return Err(format!("model key has an empty provider: {s}"));
        }
        Ok(ModelKey::new(provider, classification.parse()?))
    }
}

impl TryFrom<String> for ModelKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModelKey> for String {
    fn from(key: ModelKey) -> Self {
        key.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }
}

/// The provider-agnostic request: call parameters plus the conversation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelRequest {
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl ModelRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            params: Map::new(),
            messages,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// The caller-facing model id, if one was supplied in the parameters.
    pub fn model_id(&self) -> Option<&str> {
        self.params.get("model").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Rate-limit state advertised by a provider alongside a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_requests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_tokens: Option<Duration>,
}

impl RateLimitSnapshot {
    pub fn is_empty(&self) -> bool {
        self.remaining_tokens.is_none() && self.remaining_requests.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelResponse {
    pub model: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSnapshot>,
}

/// Correlation data carried by a request that was parked for a later retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    pub chat_id: String,
    pub turn_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub submitted_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    pub generation: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitedRequest {
    pub id: String,
    pub model_classification: ModelClassification,
    pub request: ModelRequest,
    pub metadata: RequestMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ResponseError {
    pub fn from_provider(error: &ProviderError) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
            retry_after: error.retry_after().map(|d| d.as_millis() as u64),
        }
    }
}

/// The outcome of a parked request, as kept in the response store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ModelResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    pub processed_at: u64,
}

impl ProcessedResponse {
    pub fn success(id: impl Into<String>, response: ModelResponse, processed_at: u64) -> Self {
        Self {
            id: id.into(),
            response: Some(response),
            error: None,
            processed_at,
        }
    }

    pub fn failure(id: impl Into<String>, error: ResponseError, processed_at: u64) -> Self {
        Self {
            id: id.into(),
            response: None,
            error: Some(error),
            processed_at,
        }
    }

    pub fn is_success(&self) -> bool {
        self.response.is_some()
    }
}

/// Token and request budget believed available for a model in its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCapacity {
    pub tokens_per_minute: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u64>,
    pub last_updated: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<u64>,
}

impl ModelCapacity {
    pub fn full(tokens_per_minute: u64, requests_per_minute: Option<u64>, now: u64) -> Self {
        Self {
            tokens_per_minute,
            requests_per_minute,
            last_updated: now,
            reset_at: None,
        }
    }

    /// Capacity that stays at zero until `reset_at`.
    pub fn exhausted(now: u64, reset_at: u64) -> Self {
        Self {
            tokens_per_minute: 0,
            requests_per_minute: Some(0),
            last_updated: now,
            reset_at: Some(reset_at),
        }
    }

    pub fn is_blocked(&self, now: u64) -> bool {
        self.reset_at.is_some_and(|reset_at| now < reset_at)
    }

    pub fn available_tokens(&self, now: u64) -> u64 {
        if self.is_blocked(now) {
            0
        } else {
            self.tokens_per_minute
        }
    }

    pub fn has_capacity(&self, tokens: u64, now: u64) -> bool {
        !self.is_blocked(now)
            && tokens <= self.tokens_per_minute
            && self.requests_per_minute.is_none_or(|r| r > 0)
    }

    /// Take `tokens` (and one request) out of the budget.
    pub fn consume(&mut self, tokens: u64) {
        self.tokens_per_minute = self.tokens_per_minute.saturating_sub(tokens);
        if let Some(requests) = self.requests_per_minute.as_mut() {
            *requests = requests.saturating_sub(1);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMethod {
    Generate,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuedStatus {
    Pending,
    Processing,
}

/// An entry of a per-model admission queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedRequest {
    pub id: String,
    pub model_type: String,
    pub method: QueueMethod,
    pub params: ModelRequest,
    pub token_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub status: QueuedStatus,
    pub queued_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_queue_instance_id: Option<String>,
}

impl QueuedRequest {
    pub fn age(&self, now: u64) -> Duration {
        Duration::from_millis(now.saturating_sub(self.queued_at))
    }
}

/// A piece of a streamed model response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    TextDelta(String),
    /// An in-band failure. `retry` is filled in when the request was parked for a later retry.
    Error {
        error: ProviderError,
        retry: Option<crate::errors::RetryLaterSignal>,
    },
    /// Follows an [`StreamChunk::Error`] whose request could not be parked.
    StoreFailure(crate::store::StoreError),
    Finish {
        usage: Option<Usage>,
    },
}
