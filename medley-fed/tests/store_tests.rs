//! SQLite shared store: TTL, compare-and-swap, and cross-process sharing

use medley_common::ManualClock;
use medley_fed::ratelimit::{Acquire, BucketSpec, RateLimiter};
use medley_fed::store::{BucketState, SharedStore, SqliteStore};
use medley_fed::RateLimit;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn open(dir: &TempDir, clock: Arc<ManualClock>) -> SqliteStore {
    SqliteStore::open_with_clock(&dir.path().join("shared.db"), clock)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_sqlite_cache_ttl_and_overwrite() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let store = open(&dir, clock.clone()).await;

    store.put("k", b"first", Duration::from_secs(10)).await.unwrap();
    store.put("k", b"second", Duration::from_secs(10)).await.unwrap();
    assert_eq!(store.get("k").await.unwrap(), Some(b"second".to_vec()));

    clock.advance_millis(10_000);
    assert_eq!(store.get("k").await.unwrap(), None);
    assert_eq!(store.purge_expired().await.unwrap(), 1);
}

#[tokio::test]
async fn test_sqlite_swap_is_conditional() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, Arc::new(ManualClock::new(0))).await;

    let initial = BucketState {
        tokens: 2.5,
        last_refill_ms: 100,
    };
    let next = BucketState {
        tokens: 1.5,
        last_refill_ms: 200,
    };

    assert!(store.swap_bucket("b", None, &initial).await.unwrap());
    assert!(!store.swap_bucket("b", None, &next).await.unwrap());
    assert!(!store.swap_bucket("b", Some(&next), &next).await.unwrap());
    assert!(store.swap_bucket("b", Some(&initial), &next).await.unwrap());
    assert_eq!(store.load_bucket("b").await.unwrap(), Some(next));
}

#[tokio::test]
async fn test_two_processes_share_one_bucket() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(50_000));
    let spec = BucketSpec::from_rate_limit(&RateLimit {
        requests: 3,
        window: Duration::from_secs(30),
    });

    let mut first = RateLimiter::with_clock(Arc::new(open(&dir, clock.clone()).await), clock.clone());
    let mut second = RateLimiter::with_clock(Arc::new(open(&dir, clock.clone()).await), clock.clone());
    first.configure("mb", spec);
    second.configure("mb", spec);

    let mut granted = 0;
    for round in 0..6 {
        let limiter = if round % 2 == 0 { &first } else { &second };
        if let Acquire::Granted { .. } = limiter.acquire("mb", 1.0).await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 3);

    // 10s refills exactly one token at 0.1 tokens/s
    clock.advance_millis(10_000);
    assert!(matches!(
        second.acquire("mb", 1.0).await.unwrap(),
        Acquire::Granted { .. }
    ));
    assert!(matches!(
        first.acquire("mb", 1.0).await.unwrap(),
        Acquire::Limited { .. }
    ));
}

#[tokio::test]
async fn test_store_reopens_existing_file() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    {
        let store = open(&dir, clock.clone()).await;
        store.put("k", b"v", Duration::from_secs(60)).await.unwrap();
    }
    let reopened = open(&dir, clock).await;
    assert_eq!(reopened.get("k").await.unwrap(), Some(b"v".to_vec()));
}
