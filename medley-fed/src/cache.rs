//! Response cache over the shared store
//!
//! Keys are fingerprints of the normalized request; values are JSON. Only
//! normalized results and aggregate responses are cached, never raw payloads.

use crate::error::StoreError;
use crate::store::SharedStore;
use crate::types::CacheClass;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// TTLs per cache class
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub catalog_ttl_secs: u64,
    pub live_ttl_secs: u64,
    /// Key prefix shared by cooperating processes
    pub namespace: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            catalog_ttl_secs: 86_400,
            live_ttl_secs: 300,
            namespace: "medley".to_string(),
        }
    }
}

/// Stable fingerprint of a request
///
/// Text is trimmed and lower-cased; the source set is sorted and
/// de-duplicated, so `{a,b}` and `{b,a}` produce the same key.
pub fn fingerprint(text: &str, sources: &[String], page: u32, category: Option<&str>) -> String {
    let mut sorted: Vec<&str> = sources.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut hasher = Sha256::new();
    hasher.update(text.trim().to_lowercase().as_bytes());
    hasher.update([0x1e]);
    for source in sorted {
        hasher.update(source.as_bytes());
        hasher.update([0x1f]);
    }
    hasher.update([0x1e]);
    hasher.update(page.to_be_bytes());
    if let Some(category) = category {
        hasher.update([0x1e]);
        hasher.update(category.trim().to_lowercase().as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

pub struct ResponseCache {
    store: Arc<dyn SharedStore>,
    catalog_ttl: Duration,
    live_ttl: Duration,
    namespace: String,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn SharedStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            catalog_ttl: Duration::from_secs(config.catalog_ttl_secs),
            live_ttl: Duration::from_secs(config.live_ttl_secs),
            namespace: config.namespace.clone(),
        }
    }

    pub fn ttl_for(&self, class: CacheClass) -> Duration {
        match class {
            CacheClass::Catalog => self.catalog_ttl,
            CacheClass::Live => self.live_ttl,
        }
    }

    fn key(&self, kind: &str, fingerprint: &str) -> String {
        format!("{}:{}:{}", self.namespace, kind, fingerprint)
    }

    /// Typed read; a value that no longer decodes is treated as a miss
    pub async fn get<T: DeserializeOwned>(
        &self,
        kind: &str,
        fingerprint: &str,
    ) -> Result<Option<T>, StoreError> {
        let key = self.key(kind, fingerprint);
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                debug!(key = %key, "Cache hit");
                Ok(Some(value))
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                Ok(None)
            }
        }
    }

    /// Write or overwrite; a zero TTL skips the write
    pub async fn put<T: Serialize>(
        &self,
        kind: &str,
        fingerprint: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        if ttl.is_zero() {
            return Ok(());
        }
        let bytes = serde_json::to_vec(value)?;
        self.store.put(&self.key(kind, fingerprint), &bytes, ttl).await
    }

    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        self.store.purge_expired().await
    }
}
