//! Distributed token-bucket rate limiter
//!
//! One bucket per source id, stored in the [`SharedStore`] so every
//! orchestrator process draws from the same budget.
//!
//! # Algorithm
//! Refill is computed lazily on each acquisition:
//! `tokens = min(capacity, tokens + elapsed_secs * refill_per_sec)`.
//! The decrement is committed with a single compare-and-swap; losing the
//! race means re-reading and recomputing, never double-spending. A bucket
//! without enough tokens is reported immediately with a retry-after
//! estimate; acquisition never sleeps.

use crate::error::LimiterError;
use crate::store::{BucketState, SharedStore};
use crate::types::RateLimit;
use medley_common::{Clock, SystemClock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Compare-and-swap attempts before giving up on a contended bucket
const MAX_SWAP_ATTEMPTS: u32 = 8;

/// Bucket shape for one source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl BucketSpec {
    /// `requests` per `window`, bursting up to `requests`
    pub fn from_rate_limit(limit: &RateLimit) -> Self {
        let window_secs = limit.window.as_secs_f64().max(f64::EPSILON);
        Self {
            capacity: f64::from(limit.requests),
            refill_per_sec: f64::from(limit.requests) / window_secs,
        }
    }
}

/// Result of an acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Acquire {
    Granted { remaining: f64 },
    Limited { retry_after: Duration },
}

pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    namespace: String,
    buckets: HashMap<String, BucketSpec>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            namespace: "medley".to_string(),
            buckets: HashMap::new(),
        }
    }

    /// Prefix for bucket keys, shared by every process using one store
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn configure(&mut self, source: impl Into<String>, spec: BucketSpec) {
        self.buckets.insert(source.into(), spec);
    }

    fn bucket_key(&self, source: &str) -> String {
        format!("{}:rl:{}", self.namespace, source)
    }

    /// Try to take `cost` tokens from the source's bucket
    pub async fn acquire(&self, source: &str, cost: f64) -> Result<Acquire, LimiterError> {
        let spec = *self
            .buckets
            .get(source)
            .ok_or_else(|| LimiterError::Unconfigured(source.to_string()))?;
        let key = self.bucket_key(source);

        for attempt in 0..MAX_SWAP_ATTEMPTS {
            let now = self.clock.now_millis();
            let stored = self.store.load_bucket(&key).await?;
            let tokens = refill(&spec, stored.as_ref(), now);

            if tokens < cost {
                let retry_after = retry_after(&spec, tokens, cost);
                debug!(
                    source = %source,
                    tokens,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Rate limit bucket empty"
                );
                return Ok(Acquire::Limited { retry_after });
            }

            let next = BucketState {
                tokens: tokens - cost,
                last_refill_ms: stored.map_or(now, |s| s.last_refill_ms.max(now)),
            };
            if self.store.swap_bucket(&key, stored.as_ref(), &next).await? {
                return Ok(Acquire::Granted {
                    remaining: next.tokens,
                });
            }
            debug!(source = %source, attempt, "Bucket swap lost a race, retrying");
        }

        warn!(source = %source, "Rate limit bucket contention exhausted retries");
        Err(LimiterError::Contention(source.to_string()))
    }
}

/// Tokens available at `now` (a missing bucket starts full)
fn refill(spec: &BucketSpec, stored: Option<&BucketState>, now: i64) -> f64 {
    match stored {
        None => spec.capacity,
        Some(state) => {
            let elapsed_secs = (now - state.last_refill_ms).max(0) as f64 / 1000.0;
            (state.tokens + elapsed_secs * spec.refill_per_sec).min(spec.capacity)
        }
    }
}

fn retry_after(spec: &BucketSpec, tokens: f64, cost: f64) -> Duration {
    if spec.refill_per_sec <= 0.0 || cost > spec.capacity {
        return Duration::MAX;
    }
    Duration::from_secs_f64(((cost - tokens) / spec.refill_per_sec).max(0.0))
}
