//! Shared fixtures for medley-fed integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use medley_fed::store::{BucketState, MemoryStore, SharedStore};
use medley_fed::{
    AdapterFailure, Dispatcher, Engine, EngineDescriptor, FailureKind, FederationConfig, Query,
    RateLimit, RawResult, Registry, StoreError,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a mock engine does when fetched
#[derive(Clone)]
pub enum Behavior {
    Items(Vec<Value>),
    /// Answer after a delay
    Delayed(Duration, Vec<Value>),
    /// Never answer
    Hang,
    Fail(FailureKind),
}

pub struct MockEngine {
    pub descriptor: EngineDescriptor,
    behavior: Behavior,
    calls: Arc<AtomicUsize>,
}

impl MockEngine {
    /// Generous default rate limit so repeated searches are not throttled
    pub fn new(id: &str, behavior: Behavior) -> Self {
        let mut descriptor = EngineDescriptor::new(id);
        descriptor.rate_limit = RateLimit::per_second(1000);
        Self {
            descriptor,
            behavior,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.descriptor.timeout = timeout;
        self
    }

    pub fn with_rate_limit(mut self, requests: u32, window: Duration) -> Self {
        self.descriptor.rate_limit = RateLimit { requests, window };
        self
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.descriptor.category = category.to_string();
        self
    }

    pub fn with_paging(mut self) -> Self {
        self.descriptor.capabilities.paging = true;
        self
    }

    /// Handle for counting fetches after the engine is registered
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Engine for MockEngine {
    fn describe(&self) -> EngineDescriptor {
        self.descriptor.clone()
    }

    async fn fetch(&self, _query: &Query, _page: u32) -> RawResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let id = self.descriptor.id.clone();
        match &self.behavior {
            Behavior::Items(items) => RawResult::success(id, started.elapsed(), items.clone()),
            Behavior::Delayed(delay, items) => {
                tokio::time::sleep(*delay).await;
                RawResult::success(id, started.elapsed(), items.clone())
            }
            Behavior::Hang => {
                std::future::pending::<()>().await;
                RawResult::timeout(id, started.elapsed())
            }
            Behavior::Fail(kind) => RawResult::failure(
                id,
                started.elapsed(),
                AdapterFailure::new(*kind, "upstream stack trace at db-07.internal:5432"),
            ),
        }
    }
}

/// A track payload item in the default field layout
pub fn track(id: &str, title: &str, artist: Option<&str>, duration: Option<u32>, thumbnail: bool) -> Value {
    let mut item = json!({
        "id": id,
        "title": title,
        "url": format!("https://example.com/track/{}", id),
    });
    if let Some(artist) = artist {
        item["artist"] = json!(artist);
    }
    if let Some(duration) = duration {
        item["duration"] = json!(duration);
    }
    if thumbnail {
        item["thumbnail"] = json!(format!("https://img.example.com/{}.jpg", id));
    }
    item
}

pub struct Harness {
    pub dispatcher: Dispatcher,
    pub store: Arc<MemoryStore>,
}

/// Register engines in the given order and build a dispatcher over a fresh store
pub fn harness(engines: Vec<MockEngine>, config: FederationConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = dispatcher_over(engines, config, store.clone());
    Harness { dispatcher, store }
}

pub fn dispatcher_over(
    engines: Vec<MockEngine>,
    config: FederationConfig,
    store: Arc<dyn SharedStore>,
) -> Dispatcher {
    let mut registry = Registry::new();
    for engine in engines {
        registry.register_engine(Arc::new(engine)).unwrap();
    }
    Dispatcher::new(Arc::new(registry), store, &config)
}

/// Memory store that sleeps before every operation, like a contended SQLite file
pub struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl SharedStore for SlowStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.put(key, value, ttl).await
    }

    async fn load_bucket(&self, key: &str) -> Result<Option<BucketState>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.load_bucket(key).await
    }

    async fn swap_bucket(
        &self,
        key: &str,
        expected: Option<&BucketState>,
        new: &BucketState,
    ) -> Result<bool, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.swap_bucket(key, expected, new).await
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        self.inner.purge_expired().await
    }
}

pub fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}
