//! medley-fed configuration (`medley-fed.toml`)
//!
//! Every section falls back to compiled defaults, so a partial file only
//! needs the keys it changes:
//!
//! ```toml
//! [dispatcher]
//! max_concurrency = 4
//!
//! [store]
//! backend = "sqlite"
//! path = "/var/lib/medley/shared.db"
//!
//! [rate_limits.deezer]
//! requests = 50
//! window_ms = 5000
//!
//! [[engines]]
//! id = "deezer"
//! adapter = "http_json"
//! url = "https://api.deezer.com/search?q={query}&index={offset}"
//! results_pointer = "/data"
//! paging = true
//! ```

use crate::cache::CacheConfig;
use crate::dispatcher::DispatcherConfig;
use crate::engine::HealthConfig;
use crate::error::StoreError;
use crate::normalize::{FieldMapping, QualityWeights};
use crate::reconcile::ReconcileConfig;
use crate::store::{MemoryStore, SharedStore, SqliteStore};
use crate::types::{CacheClass, RateLimit};
use medley_common::config::{
    default_data_dir, load_or_default, resolve_config_path, LoggingConfig, CONFIG_ENV_VAR,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Config file name looked up in the config directories
pub const CONFIG_FILE_NAME: &str = "medley-fed.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub logging: LoggingConfig,
    pub dispatcher: DispatcherConfig,
    pub cache: CacheConfig,
    pub store: StoreConfig,
    pub quality: QualityConfig,
    pub reconcile: ReconcileConfig,
    pub health: HealthConfig,
    /// Per-source overrides of the declared rate limit
    pub rate_limits: HashMap<String, RateLimit>,
    pub engines: Vec<EngineConfig>,
}

impl FederationConfig {
    /// Resolve (CLI, `MEDLEY_CONFIG`, user dir, /etc) and load
    pub fn load(cli_path: Option<&Path>) -> medley_common::Result<Self> {
        let path = resolve_config_path(cli_path, CONFIG_ENV_VAR, CONFIG_FILE_NAME);
        load_or_default(path.as_deref())
    }

    pub fn from_toml_str(content: &str) -> medley_common::Result<Self> {
        toml::from_str(content)
            .map_err(|e| medley_common::Error::Config(format!("Parse failed: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// SQLite file; defaults to `<data dir>/medley/shared.db`
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn sqlite_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("shared.db"))
    }

    /// Open the configured backend
    pub async fn open(&self) -> Result<Arc<dyn SharedStore>, StoreError> {
        Ok(match self.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Sqlite => Arc::new(SqliteStore::open(&self.sqlite_path()).await?),
        })
    }
}

/// Quality rubric and per-source trust
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub weights: QualityWeights,
    /// Trust for sources missing from `trust`
    pub default_trust: f64,
    pub trust: HashMap<String, f64>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            weights: QualityWeights::default(),
            default_trust: 0.5,
            trust: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    HttpJson,
    Musicbrainz,
}

/// One `[[engines]]` entry
///
/// Adapter-specific keys are ignored by adapters that don't use them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineConfig {
    pub id: String,
    pub adapter: AdapterKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub category: Option<String>,
    pub timeout_ms: Option<u64>,
    pub cache_class: Option<CacheClass>,
    pub paging: Option<bool>,
    /// API key; engines that require one are disabled without it
    pub credential: Option<String>,

    // http_json
    /// URL template with `{query}`, `{page}` and `{offset}` placeholders
    pub url: Option<String>,
    /// JSON pointer to the result array ("" = the body itself)
    #[serde(default)]
    pub results_pointer: String,
    /// Header carrying the credential (e.g. "X-Api-Key")
    pub api_key_header: Option<String>,
    #[serde(default)]
    pub fields: FieldMapping,

    // shared
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    pub user_agent: Option<String>,
    /// Override of the upstream base URL
    pub base_url: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_page_size() -> u32 {
    25
}
