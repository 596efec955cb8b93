//! Engine contract and registry
//!
//! Every source adapter implements [`Engine`]. Adapters are registered once at
//! process start into a [`Registry`], which the dispatcher then holds
//! read-only for the life of the process.

pub mod health;

pub use health::{HealthConfig, HealthTracker};

use crate::error::RegistryError;
use crate::types::{EngineDescriptor, Query, RawResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Source adapter contract
///
/// Implementations must be safe to call concurrently from many queries.
/// `fetch` enforces its own declared timeout and reports transport failure
/// through the outcome tag; an empty result list is a normal success.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Static metadata for this adapter
    fn describe(&self) -> EngineDescriptor;

    /// Run the query against the upstream source
    async fn fetch(&self, query: &Query, page: u32) -> RawResult;
}

/// A registered adapter with its descriptor
#[derive(Clone)]
pub struct RegisteredEngine {
    pub descriptor: EngineDescriptor,
    pub engine: Arc<dyn Engine>,
    /// Disabled engines are excluded from the default source set only
    pub enabled: bool,
    /// Declaration order (0-based)
    pub order: usize,
}

impl RegisteredEngine {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

impl std::fmt::Debug for RegisteredEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredEngine")
            .field("id", &self.descriptor.id)
            .field("enabled", &self.enabled)
            .field("order", &self.order)
            .finish()
    }
}

/// Static set of registered adapters
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<RegisteredEngine>,
    index: HashMap<String, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under the descriptor's id
    ///
    /// The descriptor may differ from `engine.describe()` when configuration
    /// overrides limits or timeouts.
    pub fn register(
        &mut self,
        descriptor: EngineDescriptor,
        engine: Arc<dyn Engine>,
    ) -> Result<(), RegistryError> {
        descriptor.validate()?;
        if self.index.contains_key(&descriptor.id) {
            return Err(RegistryError::DuplicateSource(descriptor.id));
        }

        let order = self.entries.len();
        info!(
            source = %descriptor.id,
            category = %descriptor.category,
            timeout_ms = descriptor.timeout.as_millis() as u64,
            "Registered engine"
        );
        self.index.insert(descriptor.id.clone(), order);
        self.entries.push(RegisteredEngine {
            descriptor,
            engine,
            enabled: true,
            order,
        });
        Ok(())
    }

    /// Register using the adapter's own descriptor
    pub fn register_engine(&mut self, engine: Arc<dyn Engine>) -> Result<(), RegistryError> {
        let descriptor = engine.describe();
        self.register(descriptor, engine)
    }

    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<(), RegistryError> {
        let idx = *self
            .index
            .get(id)
            .ok_or_else(|| RegistryError::UnknownSource(vec![id.to_string()]))?;
        self.entries[idx].enabled = enabled;
        debug!(source = %id, enabled, "Engine enablement changed");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&RegisteredEngine> {
        self.index.get(id).map(|&idx| &self.entries[idx])
    }

    /// Resolve explicit source ids
    ///
    /// Returns engines in declaration order with duplicates collapsed.
    /// Fails with every unrecognized id listed, in request order.
    pub fn resolve(&self, ids: &[String]) -> Result<Vec<&RegisteredEngine>, RegistryError> {
        let mut unknown: Vec<String> = Vec::new();
        let mut found: Vec<usize> = Vec::new();

        for id in ids {
            match self.index.get(id.as_str()) {
                Some(&idx) => found.push(idx),
                None => {
                    if !unknown.contains(id) {
                        unknown.push(id.clone());
                    }
                }
            }
        }

        if !unknown.is_empty() {
            return Err(RegistryError::UnknownSource(unknown));
        }

        found.sort_unstable();
        found.dedup();
        Ok(found.into_iter().map(|idx| &self.entries[idx]).collect())
    }

    /// Enabled engines, optionally restricted to a category
    pub fn default_sources(&self, category: Option<&str>) -> Vec<&RegisteredEngine> {
        self.entries
            .iter()
            .filter(|e| e.enabled)
            .filter(|e| category.map_or(true, |c| e.descriptor.category.eq_ignore_ascii_case(c)))
            .collect()
    }

    /// Source ids in declaration order
    pub fn declaration_order(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.descriptor.id.clone()).collect()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &EngineDescriptor> {
        self.entries.iter().map(|e| &e.descriptor)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredEngine> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::time::Duration;

    /// Adapter returning a fixed item list
    pub struct StaticEngine {
        pub descriptor: EngineDescriptor,
        pub items: Vec<serde_json::Value>,
    }

    impl StaticEngine {
        pub fn new(id: &str) -> Self {
            Self {
                descriptor: EngineDescriptor::new(id),
                items: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl Engine for StaticEngine {
        fn describe(&self) -> EngineDescriptor {
            self.descriptor.clone()
        }

        async fn fetch(&self, _query: &Query, _page: u32) -> RawResult {
            RawResult::success(
                self.descriptor.id.clone(),
                Duration::from_millis(1),
                self.items.clone(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::StaticEngine;
    use super::*;

    fn registry_with(ids: &[&str]) -> Registry {
        let mut registry = Registry::new();
        for id in ids {
            registry
                .register_engine(Arc::new(StaticEngine::new(id)))
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let mut registry = registry_with(&["deezer"]);
        let err = registry
            .register_engine(Arc::new(StaticEngine::new("deezer")))
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateSource("deezer".into()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolve_lists_only_unknown_ids() {
        let registry = registry_with(&["a", "b"]);
        let err = registry
            .resolve(&["a".into(), "zzz".into(), "b".into(), "zzz".into()])
            .unwrap_err();
        assert_eq!(err, RegistryError::UnknownSource(vec!["zzz".into()]));
    }

    #[test]
    fn test_resolve_uses_declaration_order() {
        let registry = registry_with(&["a", "b", "c"]);
        let resolved = registry
            .resolve(&["c".into(), "a".into(), "c".into()])
            .unwrap();
        let ids: Vec<_> = resolved.iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_default_sources_skip_disabled_and_filter_category() {
        let mut registry = Registry::new();
        let mut lyrics = StaticEngine::new("lyrics");
        lyrics.descriptor.category = "lyrics".into();
        registry.register_engine(Arc::new(lyrics)).unwrap();
        registry
            .register_engine(Arc::new(StaticEngine::new("catalog")))
            .unwrap();
        registry
            .register_engine(Arc::new(StaticEngine::new("off")))
            .unwrap();
        registry.set_enabled("off", false).unwrap();

        let all: Vec<_> = registry.default_sources(None).iter().map(|e| e.id().to_string()).collect();
        assert_eq!(all, vec!["lyrics", "catalog"]);

        let lyrics_only: Vec<_> = registry
            .default_sources(Some("LYRICS"))
            .iter()
            .map(|e| e.id().to_string())
            .collect();
        assert_eq!(lyrics_only, vec!["lyrics"]);

        // Disabled engines stay resolvable explicitly
        assert_eq!(registry.resolve(&["off".into()]).unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_descriptor_rejected() {
        let mut registry = Registry::new();
        let mut engine = StaticEngine::new("bad");
        engine.descriptor.rate_limit.requests = 0;
        assert!(matches!(
            registry.register_engine(Arc::new(engine)),
            Err(RegistryError::InvalidDescriptor { .. })
        ));
    }
}
