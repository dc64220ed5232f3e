//! Durable retry queues and the response store
//!
//! Requests that could not be served are parked in FIFO lists partitioned by retry generation
//! and model classification. Once a worker has run them, the outcome is written to a keyed
//! response store where the caller picks it up with its retry token.
//!
//! Every failure of the backing store is returned to the caller; nothing here swallows a
//! [`StoreError`].
use std::sync::Arc;
use tracing::{debug, instrument, trace};

use crate::store::{ENTRY_TTL, KeySpace, QueueBackend, StoreError};
use crate::types::{ModelClassification, ProcessedResponse, RateLimitedRequest};

/// Highest retry generation scanned by default.
pub const DEFAULT_MAX_GENERATION: u32 = 3;

#[derive(Debug, Clone)]
pub struct QueueManager {
    backend: Arc<dyn QueueBackend>,
    keys: KeySpace,
    max_generation: u32,
}

impl QueueManager {
    pub fn new(backend: Arc<dyn QueueBackend>, keys: KeySpace) -> Self {
        Self {
            backend,
            keys,
            max_generation: DEFAULT_MAX_GENERATION,
        }
    }

    pub fn with_max_generation(mut self, max_generation: u32) -> Self {
        self.max_generation = max_generation.max(1);
        self
    }

    pub fn max_generation(&self) -> u32 {
        self.max_generation
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// Append `request` to the tail of its `(generation, classification)` queue.
    #[instrument(skip(self, request), fields(id = %request.id))]
    pub async fn enqueue_request(&self, request: &RateLimitedRequest) -> Result<usize, StoreError> {
        let key = self
            .keys
            .retry_queue(request.metadata.generation, request.model_classification);
        let payload = serde_json::to_string(request)?;
        let depth = self.backend.push_back(&key, payload, ENTRY_TTL).await?;
        debug!(queue = %key, depth, "Request enqueued for retry");
        Ok(depth)
    }

    /// Take up to `max_count` requests from the head of a queue, oldest first.
    pub async fn dequeue_requests(
        &self,
        generation: u32,
        classification: ModelClassification,
        max_count: usize,
    ) -> Result<Vec<RateLimitedRequest>, StoreError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let key = self.keys.retry_queue(generation, classification);
        let raw = self.backend.pop_front(&key, max_count).await?;
        trace!(queue = %key, count = raw.len(), "Dequeued requests");
        raw.iter()
            .map(|value| serde_json::from_str(value).map_err(StoreError::from))
            .collect()
    }

    pub async fn queue_length(
        &self,
        generation: u32,
        classification: ModelClassification,
    ) -> Result<usize, StoreError> {
        self.backend
            .list_len(&self.keys.retry_queue(generation, classification))
            .await
    }

    /// Remove a parked request wherever it sits. Returns whether it was found.
    pub async fn remove_request(&self, id: &str) -> Result<bool, StoreError> {
        for (key, raw) in self.find_in_queues(id).await? {
            if self.backend.remove_value(&key, &raw).await? > 0 {
                debug!(queue = %key, id, "Removed queued request");
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn store_response(&self, response: &ProcessedResponse) -> Result<(), StoreError> {
        let payload = serde_json::to_string(response)?;
        self.backend
            .set(&self.keys.response(&response.id), payload, ENTRY_TTL)
            .await
    }

    pub async fn get_response(&self, id: &str) -> Result<Option<ProcessedResponse>, StoreError> {
        match self.backend.get(&self.keys.response(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn remove_response(&self, id: &str) -> Result<bool, StoreError> {
        self.backend.delete(&self.keys.response(id)).await
    }

    /// Whether `id` is known, either as a stored response or as a queued request.
    ///
    /// The response lookup is a single key read; the queue lookup walks every queue, so its cost
    /// grows with the total backlog.
    pub async fn check_if_request_exists(&self, id: &str) -> Result<bool, StoreError> {
        if self.backend.get(&self.keys.response(id)).await?.is_some() {
            return Ok(true);
        }
        Ok(!self.find_in_queues(id).await?.is_empty())
    }

    /// `(queue key, raw entry)` for every queued copy of `id`.
    async fn find_in_queues(&self, id: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut found = Vec::new();
        for generation in 1..=self.max_generation {
            for classification in ModelClassification::ALL {
                let key = self.keys.retry_queue(generation, classification);
                for raw in self.backend.range(&key).await? {
                    let entry: RateLimitedRequest = serde_json::from_str(&raw)?;
                    if entry.id == id {
                        found.push((key.clone(), raw));
                    }
                }
            }
        }
        Ok(found)
    }
}
