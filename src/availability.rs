//! Availability tracking for model identities
//!
//! When a provider reports backpressure, the affected [`ModelKey`] is disabled for a while so
//! new calls go to a fallback or straight to the retry queue instead of hammering the provider.
//!
//! The record is process-local. Each instance of a multi-instance deployment learns about
//! exhausted models on its own; the worst case is one extra rate-limited call per instance.
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::clock::{Clock, millis};
use crate::types::{ModelClassification, ModelKey};

/// No model is disabled for less than this, whatever the provider advertised.
pub const MIN_DISABLE_DURATION: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct AvailabilityTracker {
    /// Model key -> epoch millis at which it becomes available again.
    disabled: DashMap<ModelKey, u64>,
    clock: Arc<dyn Clock>,
    min_disable: Duration,
}

impl AvailabilityTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_floor(clock, MIN_DISABLE_DURATION)
    }

    /// A tracker with a custom disable floor.
    pub fn with_floor(clock: Arc<dyn Clock>, min_disable: Duration) -> Self {
        Self {
            disabled: DashMap::new(),
            clock,
            min_disable,
        }
    }

    pub fn is_model_available(&self, model: &ModelKey) -> bool {
        let now = self.clock.now_ms();
        // Prune the entry once its cooldown is over.
        self.disabled.remove_if(model, |_, until| *until <= now);
        !self.disabled.contains_key(model)
    }

    /// Disable `model` for at least the configured floor. Returns the epoch millis at which it
    /// becomes available again.
    ///
    /// An existing, longer cooldown is kept.
    pub fn temporarily_disable_model(&self, model: &ModelKey, duration: Duration) -> u64 {
        let effective = duration.max(self.min_disable);
        let until = self.clock.now_ms().saturating_add(millis(effective));

        let mut entry = self.disabled.entry(model.clone()).or_insert(until);
        if *entry < until {
            *entry = until;
        }
        let until = *entry;
        drop(entry);

        if effective > duration {
            debug!(
                model = %model,
                requested_ms = millis(duration),
                applied_ms = millis(effective),
                "Raised cooldown to the minimum disable duration"
            );
        }
        info!(model = %model, until, "Model temporarily disabled");
        until
    }

    /// The key for `provider` at `classification`, if that model is currently usable.
    pub fn get_available_model(
        &self,
        provider: &str,
        classification: ModelClassification,
    ) -> Option<ModelKey> {
        let key = ModelKey::new(provider, classification);
        self.is_model_available(&key).then_some(key)
    }

    /// When `model` becomes available again, if it is currently disabled.
    pub fn disabled_until(&self, model: &ModelKey) -> Option<u64> {
        if self.is_model_available(model) {
            None
        } else {
            self.disabled.get(model).map(|until| *until)
        }
    }

    /// Re-enable a model before its cooldown ends.
    pub fn enable_model(&self, model: &ModelKey) -> bool {
        self.disabled.remove(model).is_some()
    }
}
