//! Dispatcher - federated fan-out with a hard deadline
//!
//! Per query:
//! 1. Validate and resolve the source set (request errors fail here, before dispatch)
//! 2. Aggregate cache lookup
//! 3. Per source, concurrently: suspension check, per-source cache, rate-limit token
//! 4. Concurrent adapter calls, capped by a semaphore, each bounded by
//!    `min(source timeout, time left)`
//! 5. Stop waiting at the deadline; abort whatever is still running
//! 6. Normalize, reconcile, build the manifest, cache when fully healthy
//!
//! Shared-store I/O in steps 2 and 3 is cut off at the deadline; cache writes
//! in step 6 get at most [`CACHE_WRITE_GRACE`] past it.
//!
//! Late adapter responses land in tasks that have already been aborted and
//! are never observed by a returned response. A source that was still
//! queued for a concurrency slot at the deadline is reported `timeout`
//! without counting against its health.

use crate::cache::{fingerprint, ResponseCache};
use crate::config::FederationConfig;
use crate::engine::{HealthTracker, Registry, RegisteredEngine};
use crate::error::{RegistryError, SearchError};
use crate::normalize::Normalizer;
use crate::ratelimit::{Acquire, BucketSpec, RateLimiter};
use crate::reconcile::Reconciler;
use crate::store::SharedStore;
use crate::types::{
    AggregateResponse, CacheStatus, FetchOutcome, NormalizedResult, Query, RawResult,
    SourceReport, SourceStatus,
};
use futures::future::{join, join_all};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Cache key kind for whole responses
const AGGREGATE_KIND: &str = "agg";
/// Cache key kind for one source's normalized results
const SOURCE_KIND: &str = "src";

/// How long cache writes may run past the deadline
pub const CACHE_WRITE_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Outbound calls in flight per query; extra sources queue
    pub max_concurrency: usize,
    /// Used when the caller gives no deadline
    pub default_deadline_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            default_deadline_ms: 3000,
        }
    }
}

/// Where one selected source stands before dispatch
enum Slot {
    Settled(SourceReport, Vec<NormalizedResult>),
    Dispatch,
}

/// Fresh per-source results awaiting a cache write
struct SourceWrite {
    source: String,
    key: String,
    results: Vec<NormalizedResult>,
    ttl: Duration,
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    limiter: RateLimiter,
    cache: ResponseCache,
    normalizer: Normalizer,
    reconciler: Reconciler,
    health: HealthTracker,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Build every component from configuration around one shared store
    ///
    /// Each registered engine gets a bucket shaped by its descriptor's rate limit.
    pub fn new(registry: Arc<Registry>, store: Arc<dyn SharedStore>, config: &FederationConfig) -> Self {
        let mut limiter = RateLimiter::new(Arc::clone(&store)).with_namespace(config.cache.namespace.clone());
        for descriptor in registry.descriptors() {
            limiter.configure(
                descriptor.id.clone(),
                BucketSpec::from_rate_limit(&descriptor.rate_limit),
            );
        }

        Self {
            limiter,
            cache: ResponseCache::new(store, &config.cache),
            normalizer: Normalizer::new(
                config.quality.weights.clone(),
                config.quality.trust.clone(),
                config.quality.default_trust,
            ),
            reconciler: Reconciler::new(&config.reconcile, &registry.declaration_order()),
            health: HealthTracker::new(&config.health),
            config: config.dispatcher.clone(),
            registry,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Run one federated search
    ///
    /// Only a malformed request or an unresolvable source set is an error;
    /// every per-source failure is reported in the manifest instead.
    pub async fn search(
        &self,
        query: &Query,
        deadline: Option<Duration>,
    ) -> Result<AggregateResponse, SearchError> {
        query.validate()?;
        let budget = deadline.unwrap_or(Duration::from_millis(self.config.default_deadline_ms));
        let started = Instant::now();
        let deadline_at = started + budget;

        let engines = self.select_engines(query)?;
        let source_ids: Vec<String> = engines.iter().map(|e| e.id().to_string()).collect();
        let category = query.category.as_deref();
        let aggregate_key = fingerprint(&query.text, &source_ids, query.page, category);

        let lookup = self.cache.get::<AggregateResponse>(AGGREGATE_KIND, &aggregate_key);
        match tokio::time::timeout_at(deadline_at, lookup).await {
            Ok(Ok(Some(mut cached))) => {
                // Same fingerprint, but echo this caller's text
                cached.query = query.text.clone();
                cached.cache = CacheStatus::Hit;
                info!(query = %query.text, sources = source_ids.len(), "Served search from cache");
                return Ok(cached);
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!(error = %e, "Aggregate cache read failed, continuing uncached"),
            Err(_) => warn!("Aggregate cache read ran past the deadline, continuing uncached"),
        }

        info!(
            query = %query.text,
            page = query.page,
            sources = source_ids.len(),
            deadline_ms = budget.as_millis() as u64,
            "Dispatching search"
        );

        let slots = join_all(
            engines
                .iter()
                .map(|engine| self.prepare_within(engine, query, category, started, deadline_at)),
        )
        .await;

        let outcomes = self.fan_out(&engines, &slots, query, deadline_at).await;

        let mut manifest = Vec::with_capacity(engines.len());
        let mut normalized = Vec::new();
        let mut source_writes = Vec::new();
        for (idx, (engine, slot)) in engines.iter().zip(slots).enumerate() {
            let (report, results) = match slot {
                Slot::Settled(report, results) => (report, results),
                Slot::Dispatch => {
                    let (report, results) = self.settle(
                        engine,
                        outcomes.raw.get(&idx),
                        outcomes.invoked.contains(&idx),
                        outcomes.deadline_hit,
                        started,
                    );
                    if report.status == SourceStatus::Ok {
                        source_writes.push(SourceWrite {
                            source: engine.id().to_string(),
                            key: fingerprint(&query.text, &[engine.id().to_string()], query.page, category),
                            results: results.clone(),
                            ttl: self.cache.ttl_for(engine.descriptor.cache_class),
                        });
                    }
                    (report, results)
                }
            };
            manifest.push(report);
            normalized.extend(results);
        }

        let entities = self.reconciler.reconcile(normalized);
        let response = AggregateResponse {
            query: query.text.clone(),
            page: query.page,
            entities,
            manifest,
            cache: CacheStatus::Miss,
        };

        let aggregate_ttl = if response.is_degraded() {
            debug!("Degraded response, not cached");
            None
        } else {
            engines
                .iter()
                .map(|e| self.cache.ttl_for(e.descriptor.cache_class))
                .min()
        };
        self.write_back(
            &aggregate_key,
            &response,
            aggregate_ttl,
            &source_writes,
            deadline_at + CACHE_WRITE_GRACE,
        )
        .await;

        info!(
            query = %query.text,
            entities = response.entities.len(),
            degraded = response.is_degraded(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Search complete"
        );
        Ok(response)
    }

    /// Explicit sources, else the enabled (category) default set, minus
    /// non-paging engines beyond page 1
    fn select_engines(&self, query: &Query) -> Result<Vec<&RegisteredEngine>, SearchError> {
        let mut engines = match &query.sources {
            Some(ids) => self.registry.resolve(ids).map_err(|e| match e {
                RegistryError::UnknownSource(ids) => SearchError::UnknownSource(ids),
                _ => SearchError::NoSources,
            })?,
            None => self.registry.default_sources(query.category.as_deref()),
        };

        if query.page > 1 {
            engines.retain(|e| e.descriptor.capabilities.paging);
        }
        if engines.is_empty() {
            return Err(SearchError::NoSources);
        }
        Ok(engines)
    }

    /// [`Self::prepare`], reported `timeout` if the store is still busy at the deadline
    async fn prepare_within(
        &self,
        engine: &RegisteredEngine,
        query: &Query,
        category: Option<&str>,
        started: Instant,
        deadline_at: Instant,
    ) -> Slot {
        match tokio::time::timeout_at(deadline_at, self.prepare(engine, query, category)).await {
            Ok(slot) => slot,
            Err(_) => {
                warn!(source = %engine.id(), "Shared store did not answer before the deadline");
                let mut report = SourceReport::new(engine.id(), SourceStatus::Timeout);
                report.latency_ms = millis(started.elapsed());
                Slot::Settled(report, Vec::new())
            }
        }
    }

    /// Settle a source without dispatching when possible
    async fn prepare(&self, engine: &RegisteredEngine, query: &Query, category: Option<&str>) -> Slot {
        let id = engine.id();

        if let Some(remaining) = self.health.suspended_for(id) {
            debug!(source = %id, "Engine suspended, skipping");
            let mut report = SourceReport::new(id, SourceStatus::SkippedUnresponsive);
            report.retry_after_ms = Some(millis(remaining));
            return Slot::Settled(report, Vec::new());
        }

        let source_key = fingerprint(&query.text, &[id.to_string()], query.page, category);
        match self
            .cache
            .get::<Vec<NormalizedResult>>(SOURCE_KIND, &source_key)
            .await
        {
            Ok(Some(results)) => {
                let mut report = SourceReport::new(id, SourceStatus::Ok);
                report.cached = true;
                report.results = results.len();
                return Slot::Settled(report, results);
            }
            Ok(None) => {}
            Err(e) => warn!(source = %id, error = %e, "Source cache read failed"),
        }

        match self.limiter.acquire(id, 1.0).await {
            Ok(Acquire::Granted { .. }) => Slot::Dispatch,
            Ok(Acquire::Limited { retry_after }) => {
                let mut report = SourceReport::new(id, SourceStatus::RateLimited);
                report.retry_after_ms = Some(millis(retry_after));
                Slot::Settled(report, Vec::new())
            }
            Err(e) => {
                warn!(source = %id, error = %e, "Rate limiter unavailable, skipping source");
                let mut report = SourceReport::new(id, SourceStatus::Error);
                report.error = Some("rate limiter unavailable".to_string());
                Slot::Settled(report, Vec::new())
            }
        }
    }

    /// Run every `Slot::Dispatch` concurrently until done or the deadline
    async fn fan_out(
        &self,
        engines: &[&RegisteredEngine],
        slots: &[Slot],
        query: &Query,
        deadline_at: Instant,
    ) -> FanOut {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let query = Arc::new(query.clone());
        let mut tasks = FuturesUnordered::new();
        let mut abort_handles = Vec::new();
        let mut started_flags = Vec::new();

        for (idx, (engine, slot)) in engines.iter().zip(slots).enumerate() {
            if !matches!(slot, Slot::Dispatch) {
                continue;
            }
            let adapter = Arc::clone(&engine.engine);
            let source = engine.id().to_string();
            let source_timeout = engine.descriptor.timeout;
            let semaphore = Arc::clone(&semaphore);
            let query = Arc::clone(&query);
            let call_started = Arc::new(AtomicBool::new(false));
            started_flags.push((idx, Arc::clone(&call_started)));

            let handle = tokio::spawn(async move {
                // Permit is held until the adapter call settles
                let _permit = semaphore.acquire_owned().await.ok();
                let left = deadline_at.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return None;
                }
                call_started.store(true, Ordering::SeqCst);
                let limit = source_timeout.min(left);
                let begun = Instant::now();
                Some(match tokio::time::timeout(limit, adapter.fetch(&query, query.page)).await {
                    Ok(raw) => raw,
                    Err(_) => RawResult::timeout(source, begun.elapsed()),
                })
            });
            abort_handles.push(handle.abort_handle());
            tasks.push(handle.map(move |joined| (idx, joined)));
        }

        let mut out = FanOut {
            raw: HashMap::new(),
            invoked: HashSet::new(),
            deadline_hit: false,
        };

        let sleep = tokio::time::sleep_until(deadline_at);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                next = tasks.next() => match next {
                    Some((idx, Ok(Some(raw)))) => {
                        out.raw.insert(idx, raw);
                    }
                    Some((_, Ok(None))) => {}
                    Some((idx, Err(e))) => {
                        warn!(source = %engines[idx].id(), error = %e, "Engine task failed");
                    }
                    None => break,
                },
                _ = &mut sleep => {
                    out.deadline_hit = true;
                    break;
                }
            }
        }

        if out.deadline_hit {
            debug!(pending = tasks.len(), "Deadline elapsed, abandoning pending sources");
            for handle in &abort_handles {
                handle.abort();
            }
        }
        out.invoked = started_flags
            .iter()
            .filter(|(_, flag)| flag.load(Ordering::SeqCst))
            .map(|(idx, _)| *idx)
            .collect();
        out
    }

    /// Turn one dispatched source's outcome into a report plus results
    ///
    /// `invoked` is false when the adapter was never called, which happens
    /// when the deadline arrives while the source waits for a slot.
    fn settle(
        &self,
        engine: &RegisteredEngine,
        raw: Option<&RawResult>,
        invoked: bool,
        deadline_hit: bool,
        started: Instant,
    ) -> (SourceReport, Vec<NormalizedResult>) {
        let id = engine.id();

        let Some(raw) = raw else {
            if invoked {
                self.health.record_failure(id);
            } else {
                debug!(source = %id, "Deadline reached before the adapter call started");
            }
            let mut report = if deadline_hit || !invoked {
                SourceReport::new(id, SourceStatus::Timeout)
            } else {
                let mut report = SourceReport::new(id, SourceStatus::Error);
                report.error = Some("adapter task failed".to_string());
                report
            };
            report.latency_ms = millis(started.elapsed());
            return (report, Vec::new());
        };

        let latency_ms = millis(raw.latency);
        match &raw.outcome {
            FetchOutcome::Success(items) => {
                let batch = self.normalizer.normalize(&engine.descriptor, items);
                if batch.all_malformed() {
                    self.health.record_failure(id);
                    let mut report = SourceReport::new(id, SourceStatus::Error);
                    report.latency_ms = latency_ms;
                    report.error = Some("malformed upstream payload".to_string());
                    return (report, Vec::new());
                }

                self.health.record_success(id);
                debug!(source = %id, latency_ms, results = batch.results.len(), "Source answered");
                let mut report = SourceReport::new(id, SourceStatus::Ok);
                report.latency_ms = latency_ms;
                report.results = batch.results.len();
                (report, batch.results)
            }
            FetchOutcome::Timeout => {
                self.health.record_failure(id);
                debug!(source = %id, latency_ms, "Source timed out");
                let mut report = SourceReport::new(id, SourceStatus::Timeout);
                report.latency_ms = latency_ms;
                (report, Vec::new())
            }
            FetchOutcome::Error(failure) => {
                self.health.record_failure(id);
                debug!(source = %id, kind = ?failure.kind, detail = %failure.detail, "Source failed");
                let mut report = SourceReport::new(id, SourceStatus::Error);
                report.latency_ms = latency_ms;
                report.error = Some(failure.sanitized());
                (report, Vec::new())
            }
        }
    }

    /// Store fresh results concurrently, abandoning whatever is unfinished at `write_deadline`
    async fn write_back(
        &self,
        aggregate_key: &str,
        response: &AggregateResponse,
        aggregate_ttl: Option<Duration>,
        source_writes: &[SourceWrite],
        write_deadline: Instant,
    ) {
        let aggregate = async {
            if let Some(ttl) = aggregate_ttl {
                if let Err(e) = self.cache.put(AGGREGATE_KIND, aggregate_key, response, ttl).await {
                    warn!(error = %e, "Aggregate cache write failed");
                }
            }
        };
        let sources = join_all(source_writes.iter().map(|write| async move {
            if let Err(e) = self.cache.put(SOURCE_KIND, &write.key, &write.results, write.ttl).await {
                warn!(source = %write.source, error = %e, "Source cache write failed");
            }
        }));

        if tokio::time::timeout_at(write_deadline, join(aggregate, sources))
            .await
            .is_err()
        {
            warn!(source_writes = source_writes.len(), "Cache writes abandoned at the deadline");
        }
    }
}

struct FanOut {
    raw: HashMap<usize, RawResult>,
    /// Sources whose adapter call actually started
    invoked: HashSet<usize>,
    deadline_hit: bool,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
