//! Backing store abstraction
//!
//! Queues, capacity records and processed responses live in an external list/key-value store
//! shared by every process. Implement [`QueueBackend`] to plug in such a store; each method must
//! be atomic on its key, and writes refresh the key's time-to-live in the same operation.
//!
//! [`MemoryBackend`] is a process-local implementation, suitable for a single instance and for
//! tests.

mod memory;

pub use memory::MemoryBackend;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Time-to-live applied to every queue, capacity and response key.
pub const ENTRY_TTL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A key holds a value of the wrong shape (a list where a string was expected, or the reverse).
    #[error("key {0} holds a value of the wrong type")]
    WrongType(String),

    #[error("could not (de)serialize stored value: {0}")]
    Serialization(String),

    /// A compare-and-set kept losing to concurrent writers.
    #[error("gave up updating {0} under contention")]
    Contended(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Serialization(error.to_string())
    }
}

#[async_trait]
pub trait QueueBackend: Send + Sync + std::fmt::Debug {
    /// Append to the tail of the list at `key` and refresh its TTL. Returns the new length.
    async fn push_back(&self, key: &str, value: String, ttl: Duration) -> Result<usize, StoreError>;

    /// Remove and return up to `count` values from the head of the list.
    async fn pop_front(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError>;

    /// All values of the list, head first.
    async fn range(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Remove every occurrence of `value` from the list. Returns how many were removed.
    async fn remove_value(&self, key: &str, value: &str) -> Result<usize, StoreError>;

    /// Swap `current` for `replacement` in place, keeping its position.
    ///
    /// Returns `false` without writing anything if `current` is no longer in the list, which is
    /// how concurrent writers detect that they lost a race.
    async fn replace_value(
        &self,
        key: &str,
        current: &str,
        replacement: String,
    ) -> Result<bool, StoreError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    /// Write `value` only if the key currently holds `expected` (`None`: the key is absent or
    /// expired). Returns `false` without writing when another writer got there first.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

/// Builds the key names shared by every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("queuekeeper")
    }
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn retry_queue(
        &self,
        generation: u32,
        classification: crate::types::ModelClassification,
    ) -> String {
        format!("{}:queue:gen{}:{}", self.prefix, generation, classification)
    }

    pub fn model_queue(&self, model_type: &str) -> String {
        format!("{}:model-queue:{}", self.prefix, model_type)
    }

    pub fn response(&self, request_id: &str) -> String {
        format!("{}:response:{}", self.prefix, request_id)
    }

    pub fn capacity(&self, model_type: &str) -> String {
        format!("{}:capacity:{}", self.prefix, model_type)
    }
}
