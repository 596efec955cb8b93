//! Shared key/value store protocol
//!
//! The rate limiter and response cache share state across queries and
//! across orchestrator processes through this minimal contract:
//! - cache: get / set-with-TTL (a write to an existing key overwrites it and resets TTL)
//! - buckets: load + single compare-and-swap per bucket
//!
//! No operation spans more than one key.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Persisted token-bucket state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    /// Wall clock of the last refill (Unix ms)
    pub last_refill_ms: i64,
}

/// Atomic store contract
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Fetch an unexpired cache value
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write or overwrite a cache value
    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;

    async fn load_bucket(&self, key: &str) -> Result<Option<BucketState>, StoreError>;

    /// Replace the bucket only if it still equals `expected`
    ///
    /// `expected = None` means "create if absent". Returns false when another
    /// writer got there first.
    async fn swap_bucket(
        &self,
        key: &str,
        expected: Option<&BucketState>,
        new: &BucketState,
    ) -> Result<bool, StoreError>;

    /// Drop expired cache entries; returns how many were removed
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}
