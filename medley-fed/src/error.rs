//! Error types for medley-fed
//!
//! Only request-level problems surface as `SearchError`. Per-source
//! failures (rate limiting, timeouts, adapter errors) are recorded in the
//! response manifest and never abort a search.

use thiserror::Error;

/// Request-level search failure, raised before any dispatch occurs
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SearchError {
    /// Query text is empty after trimming
    #[error("Invalid request: query text is empty")]
    EmptyQuery,

    /// Page number below 1
    #[error("Invalid request: page must be >= 1 (got {0})")]
    InvalidPage(u32),

    /// One or more requested source ids were never registered
    #[error("Unknown source(s): {}", .0.join(", "))]
    UnknownSource(Vec<String>),

    /// The resolved source set is empty
    #[error("No eligible sources for this request")]
    NoSources,
}

/// Engine registry errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Duplicate source id: {0}")]
    DuplicateSource(String),

    #[error("Unknown source(s): {}", .0.join(", "))]
    UnknownSource(Vec<String>),

    #[error("Invalid descriptor for '{id}': {reason}")]
    InvalidDescriptor { id: String, reason: String },
}

/// Shared store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend failure (SQLite, lock poisoning)
    #[error("Store backend error: {0}")]
    Backend(String),

    /// Stored value could not be (de)serialized
    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Rate limiter errors (distinct from a denied acquisition)
#[derive(Debug, Error)]
pub enum LimiterError {
    /// No bucket configured for this source
    #[error("No rate limit configured for source '{0}'")]
    Unconfigured(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Compare-and-swap kept losing to concurrent writers
    #[error("Rate limit bucket for '{0}' is under contention")]
    Contention(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_source_lists_ids() {
        let err = SearchError::UnknownSource(vec!["bogus".into(), "nope".into()]);
        assert_eq!(err.to_string(), "Unknown source(s): bogus, nope");
    }

    #[test]
    fn test_sqlx_error_maps_to_backend() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StoreError::Backend(_)));
    }
}
