//! OpenAI-compatible provider adapter
//!
//! [`HttpModelClient`] turns a [`ModelKey`] into a concrete provider model, posts a chat
//! completion and classifies whatever comes back into a [`ProviderError`]:
//!
//! - `429` becomes `RateLimited`, with the cooldown read from `retry-after`, `retry-after-ms` or
//!   the `x-ratelimit-reset-*` headers
//! - any other `4xx` becomes `Rejected`
//! - `5xx` and transport failures become `Upstream`
//!
//! The `x-ratelimit-remaining-*` headers of successful responses are surfaced as a
//! [`RateLimitSnapshot`] so the admission queue can refresh its capacity record.
use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode, header};
use bon::Builder;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, trace};
use url::Url;

use crate::client::HttpClient;
use crate::errors::ProviderError;
use crate::sse::{SseBufferedStream, data_payloads};
use crate::traits::{ModelClient, ModelStream};
use crate::types::{
    ModelClassification, ModelKey, ModelRequest, ModelResponse, RateLimitSnapshot, StreamChunk,
    Usage,
};

/// Largest non-streamed provider response we are willing to buffer.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Connection details of one provider.
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub url: Url,
    pub api_key: Option<String>,
    /// Provider model name serving each classification.
    #[builder(default)]
    #[serde(default)]
    pub models: HashMap<ModelClassification, String>,
}

impl ProviderConfig {
    fn completions_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.url.as_str().trim_end_matches('/')
        )
    }
}

#[derive(Debug, Clone)]
pub struct HttpModelClient<T: HttpClient> {
    http: T,
    providers: Arc<HashMap<String, ProviderConfig>>,
}

impl<T: HttpClient> HttpModelClient<T> {
    pub fn new(http: T, providers: HashMap<String, ProviderConfig>) -> Self {
        Self {
            http,
            providers: Arc::new(providers),
        }
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    fn resolve(&self, model: &ModelKey) -> Result<(&ProviderConfig, &str), ProviderError> {
        let rejected = |message: String| ProviderError::Rejected {
            model: model.to_string(),
            status: None,
            message,
        };
        let provider = self
            .providers
            .get(model.provider())
            .ok_or_else(|| rejected(format!("unknown provider {}", model.provider())))?;
        let name = provider
            .models
            .get(&model.classification())
            .ok_or_else(|| rejected(format!("provider serves no {} model", model.classification())))?;
        Ok((provider, name))
    }

    async fn send(
        &self,
        model: &ModelKey,
        request: &ModelRequest,
        streaming: bool,
    ) -> Result<axum::response::Response, ProviderError> {
        let (provider, name) = self.resolve(model)?;

        let mut body = request.params.clone();
        body.insert("model".into(), Value::String(name.to_string()));
        body.insert("messages".into(), json!(request.messages));
        if streaming {
            body.insert("stream".into(), Value::Bool(true));
            body.insert("stream_options".into(), json!({"include_usage": true}));
        } else {
            body.remove("stream");
            body.remove("stream_options");
        }
        let payload = serde_json::to_vec(&body).map_err(|e| ProviderError::Rejected {
            model: model.to_string(),
            status: None,
            message: format!("could not encode request: {e}"),
        })?;

        let mut builder = axum::http::Request::builder()
            .method(Method::POST)
            .uri(provider.completions_url())
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(key) = &provider.api_key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {key}"));
        }
        let req = builder
            .body(Body::from(payload))
            .map_err(|e| ProviderError::Rejected {
                model: model.to_string(),
                status: None,
                message: format!("could not build request: {e}"),
            })?;

        trace!(model = %model, provider_model = name, streaming, "Sending provider request");
        let response = self
            .http
            .request(req)
            .await
            .map_err(|e| ProviderError::Upstream {
                model: model.to_string(),
                status: None,
                message: format!("transport error: {e}"),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), MAX_BODY_BYTES)
            .await
            .unwrap_or_default();
        Err(classify_failure(model, status, &headers, &body))
    }
}

#[async_trait::async_trait]
impl<T: HttpClient> ModelClient for HttpModelClient<T> {
    #[instrument(skip(self, request), fields(model = %model))]
    async fn generate(
        &self,
        model: &ModelKey,
        request: &ModelRequest,
    ) -> Result<ModelResponse, ProviderError> {
        let response = self.send(model, request, false).await?;
        let snapshot = rate_limit_snapshot(response.headers());
        let body = axum::body::to_bytes(response.into_body(), MAX_BODY_BYTES)
            .await
            .map_err(|e| ProviderError::Upstream {
                model: model.to_string(),
                status: None,
                message: format!("could not read response body: {e}"),
            })?;
        let completion: Completion =
            serde_json::from_slice(&body).map_err(|e| ProviderError::Upstream {
                model: model.to_string(),
                status: None,
                message: format!("unexpected response body: {e}"),
            })?;

        debug!(usage = ?completion.usage, "Provider call completed");
        Ok(ModelResponse {
            model: completion.model,
            content: completion
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .unwrap_or_default(),
            usage: completion.usage.map(Usage::from),
            rate_limit: (!snapshot.is_empty()).then_some(snapshot),
        })
    }

    #[instrument(skip(self, request), fields(model = %model))]
    async fn stream(
        &self,
        model: &ModelKey,
        request: &ModelRequest,
    ) -> Result<ModelStream, ProviderError> {
        let response = self.send(model, request, true).await?;
        let bytes = response.into_body().into_data_stream().boxed();
        Ok(completion_chunks(model.to_string(), bytes))
    }
}

#[derive(Debug, Deserialize)]
struct Completion {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default, alias = "delta")]
    message: WireMessage,
}

#[derive(Debug, Default, Deserialize)]
struct WireMessage {
    content: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl From<WireUsage> for Usage {
    fn from(usage: WireUsage) -> Self {
        Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        }
    }
}

struct ChunkState {
    model: String,
    events: SseBufferedStream<BoxStream<'static, Result<Bytes, axum::Error>>>,
    pending: VecDeque<StreamChunk>,
    usage: Option<Usage>,
    done: bool,
}

impl ChunkState {
    fn ingest(&mut self, event: &[u8]) {
        for payload in data_payloads(event) {
            if payload == "[DONE]" {
                self.finish();
                return;
            }
            let Ok(value) = serde_json::from_str::<Value>(&payload) else {
                trace!(payload, "Skipping undecodable stream event");
                continue;
            };
            if let Some(error) = value.get("error") {
                self.pending.push_back(StreamChunk::Error {
                    error: classify_inband(&self.model, error),
                    retry: None,
                });
                continue;
            }
            let Ok(chunk) = serde_json::from_value::<Completion>(value) else {
                continue;
            };
            if let Some(usage) = chunk.usage {
                self.usage = Some(usage.into());
            }
            for choice in chunk.choices {
                if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
                    self.pending.push_back(StreamChunk::TextDelta(text));
                }
            }
        }
    }

    fn finish(&mut self) {
        self.pending.push_back(StreamChunk::Finish { usage: self.usage });
        self.done = true;
    }
}

/// Decode an OpenAI-style SSE body into stream chunks, always ending with `Finish`.
fn completion_chunks(
    model: String,
    bytes: BoxStream<'static, Result<Bytes, axum::Error>>,
) -> ModelStream {
    let state = ChunkState {
        model,
        events: SseBufferedStream::new(bytes),
        pending: VecDeque::new(),
        usage: None,
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(chunk) = state.pending.pop_front() {
                return Some((chunk, state));
            }
            if state.done {
                return None;
            }
            match state.events.next().await {
                Some(Ok(event)) => state.ingest(&event),
                Some(Err(e)) => {
                    let error = ProviderError::Upstream {
                        model: state.model.clone(),
                        status: None,
                        message: format!("stream interrupted: {e}"),
                    };
                    state.pending.push_back(StreamChunk::Error { error, retry: None });
                    state.finish();
                }
                None => state.finish(),
            }
        }
    })
    .boxed()
}

/// Classify a non-success provider response.
pub fn classify_failure(
    model: &ModelKey,
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
) -> ProviderError {
    let message = error_message(body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("provider error")
            .to_string()
    });
    let model = model.to_string();
    if status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::RateLimited {
            model,
            message,
            retry_after: retry_after(headers),
        }
    } else if status.is_client_error() {
        ProviderError::Rejected {
            model,
            status: Some(status.as_u16()),
            message,
        }
    } else {
        ProviderError::Upstream {
            model,
            status: Some(status.as_u16()),
            message,
        }
    }
}

fn error_message(body: &[u8]) -> Option<String> {
    if let Ok(value) = serde_json::from_slice::<Value>(body)
        && let Some(message) = value.pointer("/error/message").and_then(Value::as_str)
    {
        return Some(message.to_string());
    }
    let text = String::from_utf8_lossy(body).trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn classify_inband(model: &str, error: &Value) -> ProviderError {
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("stream error")
        .to_string();
    let label = |field: &str| error.get(field).and_then(Value::as_str).unwrap_or_default();
    let rate_limited = ["type", "code"]
        .into_iter()
        .any(|field| label(field).contains("rate_limit"));
    if rate_limited {
        ProviderError::RateLimited {
            model: model.to_string(),
            message,
            retry_after: None,
        }
    } else {
        ProviderError::Upstream {
            model: model.to_string(),
            status: None,
            message,
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// The cooldown a rate-limited provider asked for, if any.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(ms) = header_str(headers, "retry-after-ms").and_then(|v| v.parse::<f64>().ok()) {
        return Some(Duration::from_secs_f64(ms.max(0.0) / 1000.0));
    }
    if let Some(secs) = header_str(headers, "retry-after").and_then(|v| v.parse::<f64>().ok()) {
        return Some(Duration::from_secs_f64(secs.max(0.0)));
    }
    ["x-ratelimit-reset-tokens", "x-ratelimit-reset-requests"]
        .iter()
        .filter_map(|name| header_str(headers, name).and_then(parse_reset_duration))
        .max()
}

/// Parse durations such as `6m0s`, `1.5s`, `20ms`, `1h2m` or a bare number of seconds.
pub fn parse_reset_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<f64>() {
        return (secs >= 0.0).then(|| Duration::from_secs_f64(secs));
    }

    let mut total = 0.0;
    let mut rest = raw;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .filter(|&i| i > 0)?;
        let value: f64 = rest[..split].parse().ok()?;
        rest = &rest[split..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let seconds = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 0.001,
            _ => return None,
        };
        total += value * seconds;
        rest = &rest[unit_len..];
    }
    Some(Duration::from_secs_f64(total))
}

/// Budget figures advertised alongside a successful response.
pub fn rate_limit_snapshot(headers: &HeaderMap) -> RateLimitSnapshot {
    let number = |name: &str| header_str(headers, name).and_then(|v| v.parse::<u64>().ok());
    RateLimitSnapshot {
        remaining_tokens: number("x-ratelimit-remaining-tokens"),
        remaining_requests: number("x-ratelimit-remaining-requests"),
        reset_tokens: header_str(headers, "x-ratelimit-reset-tokens")
            .and_then(parse_reset_duration),
    }
}
