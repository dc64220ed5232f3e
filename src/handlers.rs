/// Axum handlers for the gateway
use crate::AppState;
use crate::errors::AdmissionError;
use crate::failover::CallContext;
use crate::middleware::{RATE_LIMIT_CONTEXT_HEADER, RateLimitContext, RetryOrchestrator};
use crate::traits::ModelClient;
use crate::types::{Message, ModelRequest, ResponseError, StreamChunk};
use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, instrument, warn};

/// Body of `/v1/generate` and `/v1/stream`. Anything besides the listed fields is passed to the
/// provider as a call parameter.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBody {
    pub chat_id: String,
    pub turn_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl GenerateBody {
    fn into_parts(self) -> (CallContext, String, ModelRequest) {
        let mut call = CallContext::new(self.chat_id, self.turn_id);
        call.user_id = self.user_id;
        let mut request = ModelRequest::new(self.messages);
        request.params = self.params;
        request
            .params
            .insert("model".into(), Value::String(self.model.clone()));
        (call, self.model, request)
    }
}

/// An [`AdmissionError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(AdmissionError);

impl From<AdmissionError> for ApiError {
    fn from(error: AdmissionError) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            AdmissionError::RetryLater(signal) => {
                (StatusCode::ACCEPTED, Json(signal)).into_response()
            }
            AdmissionError::Provider(e) => {
                let status = e
                    .status()
                    .and_then(|s| StatusCode::from_u16(s).ok())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                let body = json!({ "error": ResponseError::from_provider(&e) });
                (status, Json(body)).into_response()
            }
            other => {
                let status = match &other {
                    AdmissionError::Validation { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                    AdmissionError::UnknownModel(_) => StatusCode::NOT_FOUND,
                    AdmissionError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    error!(error = %other, "Request failed");
                }
                let body = json!({
                    "error": { "type": other.kind(), "message": other.to_string() }
                });
                (status, Json(body)).into_response()
            }
        }
    }
}

/// Build the orchestrator for one request, from the caller's context header if it sent one.
fn orchestrator<M: ModelClient + 'static>(
    state: &AppState<M>,
    headers: &HeaderMap,
    model_id: &str,
) -> Result<RetryOrchestrator<M>, Response> {
    let context = match headers.get(RATE_LIMIT_CONTEXT_HEADER) {
        Some(raw) => {
            let parsed = raw
                .to_str()
                .ok()
                .and_then(|raw| RateLimitContext::deserialize(raw).ok());
            match parsed {
                Some(context) => context,
                None => {
                    debug!("Unreadable rate-limit context header");
                    return Err(StatusCode::BAD_REQUEST.into_response());
                }
            }
        }
        None => RateLimitContext::resolve(
            state.classifier.as_ref(),
            model_id,
            state.failover.clone(),
        )
        .map_err(|e| ApiError(e).into_response())?,
    };
    Ok(RetryOrchestrator::new(
        state.client.clone(),
        state.decider.clone(),
        state.metrics.clone(),
        context,
    ))
}

fn with_context<M: ModelClient + 'static>(
    mut response: Response,
    orchestrator: &RetryOrchestrator<M>,
) -> Response {
    if let Some(value) = orchestrator
        .export_context()
        .ok()
        .and_then(|raw| HeaderValue::from_str(&raw).ok())
    {
        response
            .headers_mut()
            .insert(RATE_LIMIT_CONTEXT_HEADER, value);
    }
    response
}

#[instrument(skip(state, headers, body), fields(model = %body.model))]
pub async fn generate<M: ModelClient + 'static>(
    State(state): State<AppState<M>>,
    headers: HeaderMap,
    Json(body): Json<GenerateBody>,
) -> Response {
    let (call, model_id, request) = body.into_parts();
    let orchestrator = match orchestrator(&state, &headers, &model_id) {
        Ok(orchestrator) => orchestrator,
        Err(response) => return response,
    };

    let response = match orchestrator.generate(&call, request).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => ApiError(e).into_response(),
    };
    with_context(response, &orchestrator)
}

fn event(chunk: StreamChunk) -> Result<Event, axum::Error> {
    match chunk {
        StreamChunk::TextDelta(text) => Ok(Event::default().event("delta").data(text)),
        StreamChunk::Error { error, retry } => Event::default().event("error").json_data(json!({
            "error": ResponseError::from_provider(&error),
            "retry": retry,
        })),
        StreamChunk::StoreFailure(error) => Event::default().event("error").json_data(json!({
            "error": { "type": "store_error", "message": error.to_string() },
        })),
        StreamChunk::Finish { usage } => Event::default()
            .event("finish")
            .json_data(json!({ "usage": usage })),
    }
}

#[instrument(skip(state, headers, body), fields(model = %body.model))]
pub async fn stream<M: ModelClient + 'static>(
    State(state): State<AppState<M>>,
    headers: HeaderMap,
    Json(body): Json<GenerateBody>,
) -> Response {
    let (call, model_id, request) = body.into_parts();
    let orchestrator = match orchestrator(&state, &headers, &model_id) {
        Ok(orchestrator) => orchestrator,
        Err(response) => return response,
    };

    let response = match orchestrator.stream(&call, request).await {
        Ok(chunks) => Sse::new(chunks.map(event))
            .keep_alive(KeepAlive::default())
            .into_response(),
        Err(e) => ApiError(e).into_response(),
    };
    with_context(response, &orchestrator)
}

#[instrument(skip(state))]
pub async fn get_response<M: ModelClient + 'static>(
    State(state): State<AppState<M>>,
    Path(id): Path<String>,
) -> Response {
    match state.decider.queues().get_response(&id).await {
        Ok(Some(processed)) => Json(processed).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => ApiError(e.into()).into_response(),
    }
}

#[instrument(skip(state))]
pub async fn delete_response<M: ModelClient + 'static>(
    State(state): State<AppState<M>>,
    Path(id): Path<String>,
) -> Response {
    match state.decider.queues().remove_response(&id).await {
        Ok(true) => {
            info!(id, "Removed stored response");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => ApiError(e.into()).into_response(),
    }
}

#[instrument(skip(state))]
pub async fn get_request<M: ModelClient + 'static>(
    State(state): State<AppState<M>>,
    Path(id): Path<String>,
) -> Response {
    match state.decider.queues().check_if_request_exists(&id).await {
        Ok(true) => Json(json!({ "id": id, "exists": true })).into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(id, error = %e, "Could not look up request");
            ApiError(e.into()).into_response()
        }
    }
}
