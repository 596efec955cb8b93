//! In-process store for single-orchestrator deployments and tests

use super::{BucketState, SharedStore};
use crate::error::StoreError;
use async_trait::async_trait;
use medley_common::{Clock, SystemClock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct CacheSlot {
    value: Vec<u8>,
    expires_at_ms: i64,
}

/// HashMap-backed store; locks are never held across an await
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    cache: Mutex<HashMap<String, CacheSlot>>,
    buckets: Mutex<HashMap<String, BucketState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            cache: Mutex::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("memory store lock poisoned".to_string())
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = self.clock.now_millis();
        let mut cache = self.cache.lock().map_err(poisoned)?;
        match cache.get(key) {
            Some(slot) if slot.expires_at_ms > now => Ok(Some(slot.value.clone())),
            Some(_) => {
                cache.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let expires_at_ms = self.clock.now_millis() + ttl.as_millis() as i64;
        self.cache.lock().map_err(poisoned)?.insert(
            key.to_string(),
            CacheSlot {
                value: value.to_vec(),
                expires_at_ms,
            },
        );
        Ok(())
    }

    async fn load_bucket(&self, key: &str) -> Result<Option<BucketState>, StoreError> {
        Ok(self.buckets.lock().map_err(poisoned)?.get(key).copied())
    }

    async fn swap_bucket(
        &self,
        key: &str,
        expected: Option<&BucketState>,
        new: &BucketState,
    ) -> Result<bool, StoreError> {
        let mut buckets = self.buckets.lock().map_err(poisoned)?;
        if buckets.get(key) != expected {
            return Ok(false);
        }
        buckets.insert(key.to_string(), *new);
        Ok(true)
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let mut cache = self.cache.lock().map_err(poisoned)?;
        let before = cache.len();
        cache.retain(|_, slot| slot.expires_at_ms > now);
        Ok((before - cache.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medley_common::ManualClock;

    #[tokio::test]
    async fn test_get_respects_ttl() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::with_clock(clock.clone());

        store.put("k", b"v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        clock.advance_millis(10_000);
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_resets_ttl() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::with_clock(clock.clone());

        store.put("k", b"old", Duration::from_secs(10)).await.unwrap();
        clock.advance_millis(8_000);
        store.put("k", b"new", Duration::from_secs(10)).await.unwrap();
        clock.advance_millis(8_000);
        assert_eq!(store.get("k").await.unwrap(), Some(b"new".to_vec()));
    }

    #[tokio::test]
    async fn test_swap_requires_expected_state() {
        let store = MemoryStore::new();
        let first = BucketState { tokens: 5.0, last_refill_ms: 0 };
        let second = BucketState { tokens: 4.0, last_refill_ms: 1 };

        assert!(store.swap_bucket("b", None, &first).await.unwrap());
        assert!(!store.swap_bucket("b", None, &first).await.unwrap(), "create-if-absent fails once present");
        assert!(!store.swap_bucket("b", Some(&second), &second).await.unwrap());
        assert!(store.swap_bucket("b", Some(&first), &second).await.unwrap());
        assert_eq!(store.load_bucket("b").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::with_clock(clock.clone());
        store.put("short", b"1", Duration::from_secs(1)).await.unwrap();
        store.put("long", b"2", Duration::from_secs(60)).await.unwrap();
        clock.advance_millis(2_000);
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.get("long").await.unwrap().is_some());
    }
}
