//! Core Types for federated search
//!
//! Data flows through three shapes per query:
//! - **RawResult:** opaque adapter payload plus outcome tag
//! - **NormalizedResult:** canonical per-source record with a quality score
//! - **CanonicalEntity:** reconciled cross-source entity with provenance

use crate::error::{RegistryError, SearchError};
use crate::normalize::FieldMapping;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Query
// ============================================================================

/// A single user search request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Free-text query
    pub text: String,
    /// Explicit source filter (None = all enabled sources)
    #[serde(default)]
    pub sources: Option<Vec<String>>,
    /// Optional category used when no explicit sources are given
    #[serde(default)]
    pub category: Option<String>,
    /// 1-based page number
    pub page: u32,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sources: None,
            category: None,
            page: 1,
        }
    }

    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = Some(sources.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    /// Reject malformed requests before any dispatch
    pub fn validate(&self) -> Result<(), SearchError> {
        if self.text.trim().is_empty() {
            return Err(SearchError::EmptyQuery);
        }
        if self.page < 1 {
            return Err(SearchError::InvalidPage(self.page));
        }
        Ok(())
    }
}

// ============================================================================
// Engine descriptor
// ============================================================================

/// Entity kind of a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Track,
    Artist,
    Album,
}

impl EntityKind {
    /// Parse the loose labels adapters use
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "track" | "song" | "recording" => Some(Self::Track),
            "artist" | "band" => Some(Self::Artist),
            "album" | "release" | "release-group" => Some(Self::Album),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Track => "track",
            Self::Artist => "artist",
            Self::Album => "album",
        }
    }
}

/// Cache TTL class of a source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheClass {
    /// Stable catalog/metadata data (long TTL)
    #[default]
    Catalog,
    /// Charts, availability and other fast-moving data (short TTL)
    Live,
}

/// Declared throughput ceiling: `requests` per `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests: u32,
    #[serde(with = "duration_ms", rename = "window_ms")]
    pub window: Duration,
}

impl RateLimit {
    pub fn per_second(requests: u32) -> Self {
        Self {
            requests,
            window: Duration::from_secs(1),
        }
    }
}

/// Capability flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub paging: bool,
    pub requires_credential: bool,
}

/// Static metadata of a registered engine (immutable after registration)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineDescriptor {
    /// Unique source identifier
    pub id: String,
    /// Per-call timeout the adapter enforces
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
    pub rate_limit: RateLimit,
    pub capabilities: Capabilities,
    /// Category used for default source selection (e.g. "music", "lyrics")
    pub category: String,
    pub cache_class: CacheClass,
    /// How payload items map onto `NormalizedResult`
    pub fields: FieldMapping,
}

impl EngineDescriptor {
    /// Descriptor with defaults: 3s timeout, 1 req/s, catalog class, "music"
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timeout: Duration::from_secs(3),
            rate_limit: RateLimit::per_second(1),
            capabilities: Capabilities::default(),
            category: "music".to_string(),
            cache_class: CacheClass::Catalog,
            fields: FieldMapping::default(),
        }
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidDescriptor {
            id: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.id.trim().is_empty() {
            return Err(invalid("empty id"));
        }
        if self.timeout.is_zero() {
            return Err(invalid("timeout must be positive"));
        }
        if self.rate_limit.requests == 0 || self.rate_limit.window.is_zero() {
            return Err(invalid("rate limit must allow at least one request per non-empty window"));
        }
        Ok(())
    }
}

// ============================================================================
// Raw adapter output
// ============================================================================

/// Adapter failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "status")]
pub enum FailureKind {
    Network,
    HttpStatus(u16),
    Parse,
    Credential,
    Throttled,
}

/// Transport/parse failure reported by an adapter
///
/// `detail` may contain upstream internals; it is logged, never returned.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl AdapterFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Caller-safe reason derived from the kind only
    pub fn sanitized(&self) -> String {
        match self.kind {
            FailureKind::Network => "network failure".to_string(),
            FailureKind::HttpStatus(code) => format!("upstream returned HTTP {}", code),
            FailureKind::Parse => "unparseable upstream response".to_string(),
            FailureKind::Credential => "upstream rejected credentials".to_string(),
            FailureKind::Throttled => "upstream request quota exhausted".to_string(),
        }
    }
}

/// Outcome tag of one adapter invocation
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Payload items (possibly empty: "no results" is a success)
    Success(Vec<serde_json::Value>),
    Timeout,
    Error(AdapterFailure),
}

/// One adapter invocation result
#[derive(Debug, Clone, PartialEq)]
pub struct RawResult {
    pub source: String,
    pub latency: Duration,
    pub outcome: FetchOutcome,
}

impl RawResult {
    pub fn success(source: impl Into<String>, latency: Duration, items: Vec<serde_json::Value>) -> Self {
        Self {
            source: source.into(),
            latency,
            outcome: FetchOutcome::Success(items),
        }
    }

    pub fn timeout(source: impl Into<String>, latency: Duration) -> Self {
        Self {
            source: source.into(),
            latency,
            outcome: FetchOutcome::Timeout,
        }
    }

    pub fn failure(source: impl Into<String>, latency: Duration, failure: AdapterFailure) -> Self {
        Self {
            source: source.into(),
            latency,
            outcome: FetchOutcome::Error(failure),
        }
    }
}

// ============================================================================
// Normalized and canonical records
// ============================================================================

/// Canonical per-source result record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedResult {
    pub kind: EntityKind,
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_secs: Option<u32>,
    pub published: Option<NaiveDate>,
    pub link: Option<String>,
    pub thumbnail: Option<String>,
    pub source: String,
    pub source_id: String,
    /// Raw quality score (0.0-1.0)
    pub quality: f64,
}

/// Which source contributed to an entity, and how strongly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub source_id: String,
    pub contribution: f64,
}

/// Reconciled entity merged from one or more sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    /// Stable id derived from kind + normalized title/artist
    pub id: String,
    pub kind: EntityKind,
    /// Highest-quality contributing record
    pub primary: NormalizedResult,
    pub provenance: Vec<Provenance>,
    /// Merge confidence (0.0-1.0)
    pub confidence: f64,
}

// ============================================================================
// Aggregate response
// ============================================================================

/// Per-source manifest status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceStatus {
    Ok,
    RateLimited,
    Timeout,
    Error,
    SkippedUnresponsive,
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceStatus::Ok => write!(f, "ok"),
            SourceStatus::RateLimited => write!(f, "rate-limited"),
            SourceStatus::Timeout => write!(f, "timeout"),
            SourceStatus::Error => write!(f, "error"),
            SourceStatus::SkippedUnresponsive => write!(f, "skipped-unresponsive"),
        }
    }
}

/// Manifest line for one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: String,
    pub status: SourceStatus,
    pub latency_ms: u64,
    /// Normalized results contributed
    pub results: usize,
    /// Served from the per-source cache
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// Sanitized error reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceReport {
    pub fn new(source: impl Into<String>, status: SourceStatus) -> Self {
        Self {
            source: source.into(),
            status,
            latency_ms: 0,
            results: 0,
            cached: false,
            retry_after_ms: None,
            error: None,
        }
    }
}

/// Whether the whole response came from the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Hit,
    Miss,
}

/// Unified search response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResponse {
    pub query: String,
    pub page: u32,
    /// Sorted by descending confidence
    pub entities: Vec<CanonicalEntity>,
    /// Ordered by registry declaration order
    pub manifest: Vec<SourceReport>,
    pub cache: CacheStatus,
}

impl AggregateResponse {
    pub fn report(&self, source: &str) -> Option<&SourceReport> {
        self.manifest.iter().find(|r| r.source == source)
    }

    /// True when any source did not answer `ok`
    pub fn is_degraded(&self) -> bool {
        self.manifest.iter().any(|r| r.status != SourceStatus::Ok)
    }
}

/// Serialize `Duration` as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
