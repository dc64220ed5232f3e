//! In-process [`QueueBackend`] built on a `DashMap`.
//!
//! Every operation runs under the shard lock of its key, which gives the same per-key atomicity
//! a networked store offers through its transactions. Expiry is checked lazily on access.
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use super::{QueueBackend, StoreError};
use crate::clock::{Clock, millis, system_clock};

#[derive(Debug, Clone)]
enum Value {
    List(VecDeque<String>),
    Text(String),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: u64,
}

#[derive(Debug, Clone)]
pub struct MemoryBackend {
    slots: Arc<DashMap<String, Slot>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.slots.iter().filter(|s| s.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expiry(&self, ttl: Duration) -> u64 {
        self.clock.now_ms().saturating_add(millis(ttl))
    }

    /// Drop the key if it has expired.
    fn evict_expired(&self, key: &str) {
        let now = self.clock.now_ms();
        self.slots.remove_if(key, |_, slot| slot.expires_at <= now);
    }

    /// Run `f` against the list at `key`, if present. Empty lists are removed afterwards.
    fn with_list<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut VecDeque<String>) -> T,
    ) -> Result<Option<T>, StoreError> {
        self.evict_expired(key);
        let Some(mut slot) = self.slots.get_mut(key) else {
            return Ok(None);
        };
        let Value::List(list) = &mut slot.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };
        let result = f(list);
        let now_empty = list.is_empty();
        drop(slot);
        if now_empty {
            self.slots.remove_if(key, |_, slot| {
                matches!(&slot.value, Value::List(list) if list.is_empty())
            });
        }
        Ok(Some(result))
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn push_back(&self, key: &str, value: String, ttl: Duration) -> Result<usize, StoreError> {
        self.evict_expired(key);
        let expires_at = self.expiry(ttl);
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                let Value::List(list) = &mut slot.value else {
                    return Err(StoreError::WrongType(key.to_string()));
                };
                list.push_back(value);
                slot.expires_at = expires_at;
                Ok(list.len())
            }
            Entry::Vacant(entry) => {
                entry.insert(Slot {
                    value: Value::List(VecDeque::from([value])),
                    expires_at,
                });
                Ok(1)
            }
        }
    }

    async fn pop_front(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError> {
        let popped = self.with_list(key, |list| {
            let take = count.min(list.len());
            list.drain(..take).collect::<Vec<_>>()
        })?;
        Ok(popped.unwrap_or_default())
    }

    async fn range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let values = self.with_list(key, |list| list.iter().cloned().collect::<Vec<_>>())?;
        Ok(values.unwrap_or_default())
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.with_list(key, |list| list.len())?.unwrap_or(0))
    }

    async fn remove_value(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let removed = self.with_list(key, |list| {
            let before = list.len();
            list.retain(|v| v != value);
            before - list.len()
        })?;
        Ok(removed.unwrap_or(0))
    }

    async fn replace_value(
        &self,
        key: &str,
        current: &str,
        replacement: String,
    ) -> Result<bool, StoreError> {
        let replaced = self.with_list(key, |list| {
            match list.iter_mut().find(|v| v.as_str() == current) {
                Some(slot) => {
                    *slot = replacement;
                    true
                }
                None => false,
            }
        })?;
        Ok(replaced.unwrap_or(false))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = self.expiry(ttl);
        self.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Text(value),
                expires_at,
            },
        );
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.evict_expired(key);
        let expires_at = self.expiry(ttl);
        let slot = Slot {
            value: Value::Text(value),
            expires_at,
        };
        match (self.slots.entry(key.to_string()), expected) {
            (Entry::Vacant(entry), None) => {
                entry.insert(slot);
                Ok(true)
            }
            (Entry::Vacant(_), Some(_)) => Ok(false),
            (Entry::Occupied(mut entry), expected) => {
                let Value::Text(current) = &entry.get().value else {
                    return Err(StoreError::WrongType(key.to_string()));
                };
                if expected != Some(current.as_str()) {
                    return Ok(false);
                }
                entry.insert(slot);
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.evict_expired(key);
        match self.slots.get(key) {
            None => Ok(None),
            Some(slot) => match &slot.value {
                Value::Text(text) => Ok(Some(text.clone())),
                Value::List(_) => Err(StoreError::WrongType(key.to_string())),
            },
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.evict_expired(key);
        Ok(self.slots.remove(key).is_some())
    }
}
