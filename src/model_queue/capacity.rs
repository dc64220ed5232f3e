//! Shared capacity record for one model.
//!
//! The record lives in the backing store so every instance scheduling the same model sees the
//! same budget. A record older than one window without a reset time, or whose reset time has
//! passed, reads as a fresh full budget.
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::clock::{Clock, millis};
use crate::store::{ENTRY_TTL, QueueBackend, StoreError};
use crate::types::{ModelCapacity, RateLimitSnapshot};

/// Length of a provider rate-limit window.
pub const CAPACITY_WINDOW: Duration = Duration::from_secs(60);

const MAX_UPDATE_ATTEMPTS: usize = 16;

#[derive(Debug, Clone)]
pub(crate) struct CapacityTracker {
    backend: Arc<dyn QueueBackend>,
    key: String,
    clock: Arc<dyn Clock>,
    tokens_per_minute: u64,
    requests_per_minute: Option<u64>,
}

impl CapacityTracker {
    pub(crate) fn new(
        backend: Arc<dyn QueueBackend>,
        key: String,
        clock: Arc<dyn Clock>,
        tokens_per_minute: u64,
        requests_per_minute: Option<u64>,
    ) -> Self {
        Self {
            backend,
            key,
            clock,
            tokens_per_minute,
            requests_per_minute,
        }
    }

    fn full(&self, now: u64) -> ModelCapacity {
        ModelCapacity::full(self.tokens_per_minute, self.requests_per_minute, now)
    }

    /// The budget for the current window.
    pub(crate) async fn current(&self) -> Result<ModelCapacity, StoreError> {
        Ok(self.load().await?.1)
    }

    /// The raw stored record (if any) alongside the budget it stands for.
    async fn load(&self) -> Result<(Option<String>, ModelCapacity), StoreError> {
        let now = self.clock.now_ms();
        let Some(raw) = self.backend.get(&self.key).await? else {
            return Ok((None, self.full(now)));
        };
        let stored: ModelCapacity = serde_json::from_str(&raw)?;
        let expired = match stored.reset_at {
            Some(reset_at) => now >= reset_at,
            None => now.saturating_sub(stored.last_updated) >= millis(CAPACITY_WINDOW),
        };
        let capacity = if expired { self.full(now) } else { stored };
        Ok((Some(raw), capacity))
    }

    /// Apply `change` to the stored record with compare-and-set, retrying when another writer
    /// updated it in between.
    async fn update(
        &self,
        change: impl Fn(&mut ModelCapacity, u64),
    ) -> Result<ModelCapacity, StoreError> {
        for attempt in 0..MAX_UPDATE_ATTEMPTS {
            let (raw, mut capacity) = self.load().await?;
            change(&mut capacity, self.clock.now_ms());
            let payload = serde_json::to_string(&capacity)?;
            if self
                .backend
                .compare_and_set(&self.key, raw.as_deref(), payload, ENTRY_TTL)
                .await?
            {
                return Ok(capacity);
            }
            trace!(capacity = %self.key, attempt, "Capacity changed concurrently, retrying");
        }
        Err(StoreError::Contended(self.key.clone()))
    }

    /// Take `tokens` out of the current window.
    pub(crate) async fn consume(&self, tokens: u64) -> Result<ModelCapacity, StoreError> {
        self.update(|capacity, _| capacity.consume(tokens)).await
    }

    /// Zero the budget until `reset_at` (epoch millis).
    pub(crate) async fn block_until(&self, reset_at: u64) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        debug!(capacity = %self.key, reset_at, "Capacity zeroed");
        let payload = serde_json::to_string(&ModelCapacity::exhausted(now, reset_at))?;
        self.backend.set(&self.key, payload, ENTRY_TTL).await
    }

    /// Replace the tracked budget with what the provider reported.
    pub(crate) async fn refresh(&self, snapshot: &RateLimitSnapshot) -> Result<(), StoreError> {
        if snapshot.is_empty() {
            return Ok(());
        }
        self.update(|capacity, now| {
            if let Some(tokens) = snapshot.remaining_tokens {
                capacity.tokens_per_minute = tokens;
            }
            if snapshot.remaining_requests.is_some() {
                capacity.requests_per_minute = snapshot.remaining_requests;
            }
            capacity.last_updated = now;
            capacity.reset_at = match (snapshot.remaining_tokens, snapshot.reset_tokens) {
                (Some(0), Some(reset)) => Some(now.saturating_add(millis(reset))),
                _ => None,
            };
        })
        .await?;
        Ok(())
    }
}
