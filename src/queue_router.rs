//! Sends calls for queued models through their admission queue.
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::errors::ProviderError;
use crate::model_queue::{LanguageModelQueue, QueueOutcome};
use crate::traits::{ModelClient, ModelStream};
use crate::types::{ModelKey, ModelRequest, ModelResponse, QueueMethod};

/// A [`ModelClient`] that admits calls for models with a configured [`LanguageModelQueue`]
/// through that queue and passes everything else straight to the inner client.
#[derive(Clone)]
pub struct QueueRouter {
    inner: Arc<dyn ModelClient>,
    queues: HashMap<ModelKey, LanguageModelQueue>,
}

impl std::fmt::Debug for QueueRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRouter")
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl QueueRouter {
    pub fn new(inner: Arc<dyn ModelClient>) -> Self {
        Self {
            inner,
            queues: HashMap::new(),
        }
    }

    pub fn with_queue(mut self, queue: LanguageModelQueue) -> Self {
        self.queues.insert(queue.model().clone(), queue);
        self
    }

    pub fn queues(&self) -> impl Iterator<Item = &LanguageModelQueue> {
        self.queues.values()
    }

    async fn admit(
        &self,
        queue: &LanguageModelQueue,
        method: QueueMethod,
        request: &ModelRequest,
    ) -> Result<QueueOutcome, ProviderError> {
        let ticket = queue.enqueue(method, request.clone(), None).await?;
        debug!(model = %queue.model(), id = ticket.id(), "Call admitted through queue");

        let guard = CancelOnDrop {
            queue: queue.clone(),
            id: Some(ticket.id().to_string()),
        };
        let reply = ticket.wait().await;
        guard.disarm();
        Ok(reply?)
    }
}

/// Cancels the queued request if the caller stops waiting for it.
struct CancelOnDrop {
    queue: LanguageModelQueue,
    id: Option<String>,
}

impl CancelOnDrop {
    fn disarm(mut self) {
        self.id = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let queue = self.queue.clone();
            runtime.spawn(async move {
                if let Err(e) = queue.cancel(&id).await {
                    tracing::warn!(id, error = %e, "Could not cancel abandoned queued request");
                }
            });
        }
    }
}

#[async_trait]
impl ModelClient for QueueRouter {
    async fn generate(
        &self,
        model: &ModelKey,
        request: &ModelRequest,
    ) -> Result<ModelResponse, ProviderError> {
        let Some(queue) = self.queues.get(model) else {
            return self.inner.generate(model, request).await;
        };
        match self.admit(queue, QueueMethod::Generate, request).await? {
            QueueOutcome::Generated(response) => Ok(response),
            QueueOutcome::Streamed(_) => Err(ProviderError::Upstream {
                model: model.to_string(),
                status: None,
                message: "queue returned a stream for a one-shot call".into(),
            }),
        }
    }

    async fn stream(
        &self,
        model: &ModelKey,
        request: &ModelRequest,
    ) -> Result<ModelStream, ProviderError> {
        let Some(queue) = self.queues.get(model) else {
            return self.inner.stream(model, request).await;
        };
        match self.admit(queue, QueueMethod::Stream, request).await? {
            QueueOutcome::Streamed(stream) => Ok(stream),
            QueueOutcome::Generated(_) => Err(ProviderError::Upstream {
                model: model.to_string(),
                status: None,
                message: "queue returned a complete response for a streamed call".into(),
            }),
        }
    }
}
