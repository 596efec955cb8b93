//! Concrete source adapters and registry construction
//!
//! Adapters only translate HTTP into [`RawResult`]; everything downstream
//! (limiting, caching, normalization) is the dispatcher's job.

pub mod http_json;
pub mod musicbrainz;

pub use http_json::HttpJsonEngine;
pub use musicbrainz::MusicBrainzEngine;

use crate::config::{AdapterKind, EngineConfig, FederationConfig};
use crate::engine::{Engine, Registry};
use crate::error::RegistryError;
use crate::types::{AdapterFailure, EngineDescriptor, FailureKind, RawResult};
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Connect timeout for every adapter client
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Why an HTTP exchange produced no payload
#[derive(Debug)]
pub(crate) enum HttpError {
    Timeout,
    Failed(AdapterFailure),
}

pub(crate) fn build_client(id: &str, user_agent: &str) -> Result<reqwest::Client, RegistryError> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| RegistryError::InvalidDescriptor {
            id: id.to_string(),
            reason: format!("HTTP client: {}", e),
        })
}

/// Map an unsuccessful status onto a failure kind
pub(crate) fn classify_status(status: StatusCode) -> FailureKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FailureKind::Credential,
        StatusCode::TOO_MANY_REQUESTS => FailureKind::Throttled,
        other => FailureKind::HttpStatus(other.as_u16()),
    }
}

/// Send a request and decode the JSON body
pub(crate) async fn get_json(request: reqwest::RequestBuilder) -> Result<Value, HttpError> {
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            HttpError::Timeout
        } else {
            HttpError::Failed(AdapterFailure::new(FailureKind::Network, e.to_string()))
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(HttpError::Failed(AdapterFailure::new(
            classify_status(status),
            format!("{}: {}", status, body.chars().take(200).collect::<String>()),
        )));
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| HttpError::Failed(AdapterFailure::new(FailureKind::Parse, e.to_string())))
}

/// Run `exchange` under the source's timeout and wrap the outcome
pub(crate) async fn fetch_within<F>(source: &str, timeout: Duration, exchange: F) -> RawResult
where
    F: std::future::Future<Output = Result<Vec<Value>, HttpError>>,
{
    let started = Instant::now();
    let result = tokio::time::timeout(timeout, exchange).await;
    let latency = started.elapsed();
    match result {
        Ok(Ok(items)) => {
            debug!(source = %source, items = items.len(), latency_ms = latency.as_millis() as u64, "Fetched");
            RawResult::success(source, latency, items)
        }
        Ok(Err(HttpError::Failed(failure))) => RawResult::failure(source, latency, failure),
        Ok(Err(HttpError::Timeout)) | Err(_) => RawResult::timeout(source, latency),
    }
}

/// Build the registry from `[[engines]]`, in file order
///
/// Descriptor overrides (timeout, category, cache class, paging,
/// `[rate_limits.<id>]`) are applied before registration. An engine that
/// needs a credential but has none is registered disabled.
pub fn build_registry(config: &FederationConfig) -> Result<Registry, RegistryError> {
    let mut registry = Registry::new();

    for engine_config in &config.engines {
        let mut descriptor = match engine_config.adapter {
            AdapterKind::HttpJson => HttpJsonEngine::descriptor_for(engine_config),
            AdapterKind::Musicbrainz => MusicBrainzEngine::default_descriptor(&engine_config.id),
        };
        apply_overrides(&mut descriptor, engine_config, config);

        let engine: Arc<dyn Engine> = match engine_config.adapter {
            AdapterKind::HttpJson => Arc::new(HttpJsonEngine::new(descriptor.clone(), engine_config)?),
            AdapterKind::Musicbrainz => {
                Arc::new(MusicBrainzEngine::new(descriptor.clone(), engine_config)?)
            }
        };

        let needs_credential =
            descriptor.capabilities.requires_credential && engine_config.credential.is_none();
        registry.register(descriptor, engine)?;

        if needs_credential {
            warn!(source = %engine_config.id, "Engine requires a credential but none is configured; disabled");
            registry.set_enabled(&engine_config.id, false)?;
        } else if !engine_config.enabled {
            registry.set_enabled(&engine_config.id, false)?;
        }
    }

    Ok(registry)
}

fn apply_overrides(descriptor: &mut EngineDescriptor, engine: &EngineConfig, config: &FederationConfig) {
    if let Some(category) = &engine.category {
        descriptor.category = category.clone();
    }
    if let Some(ms) = engine.timeout_ms {
        descriptor.timeout = Duration::from_millis(ms);
    }
    if let Some(class) = engine.cache_class {
        descriptor.cache_class = class;
    }
    if let Some(paging) = engine.paging {
        descriptor.capabilities.paging = paging;
    }
    if let Some(limit) = config.rate_limits.get(&engine.id) {
        descriptor.rate_limit = *limit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CacheClass, RateLimit};

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::FORBIDDEN), FailureKind::Credential);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), FailureKind::Throttled);
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            FailureKind::HttpStatus(502)
        );
    }

    #[test]
    fn test_build_registry_applies_overrides_and_credentials() {
        let config = FederationConfig::from_toml_str(
            r#"
            [rate_limits.catalog]
            requests = 10
            window_ms = 60000

            [[engines]]
            id = "catalog"
            adapter = "http_json"
            url = "https://catalog.example/search?q={query}"
            timeout_ms = 1500
            cache_class = "live"
            category = "charts"

            [[engines]]
            id = "keyed"
            adapter = "http_json"
            url = "https://keyed.example/search?q={query}"
            api_key_header = "X-Api-Key"

            [[engines]]
            id = "musicbrainz"
            adapter = "musicbrainz"
            enabled = false
            "#,
        )
        .unwrap();

        let registry = build_registry(&config).unwrap();
        assert_eq!(registry.declaration_order(), vec!["catalog", "keyed", "musicbrainz"]);

        let catalog = registry.get("catalog").unwrap();
        assert_eq!(catalog.descriptor.timeout, Duration::from_millis(1500));
        assert_eq!(catalog.descriptor.cache_class, CacheClass::Live);
        assert_eq!(catalog.descriptor.category, "charts");
        assert_eq!(
            catalog.descriptor.rate_limit,
            RateLimit {
                requests: 10,
                window: Duration::from_secs(60)
            }
        );
        assert!(catalog.enabled);

        let keyed = registry.get("keyed").unwrap();
        assert!(keyed.descriptor.capabilities.requires_credential);
        assert!(!keyed.enabled, "no credential configured");

        assert!(!registry.get("musicbrainz").unwrap().enabled);
    }

    #[test]
    fn test_http_engine_without_url_rejected() {
        let config = FederationConfig::from_toml_str(
            r#"
            [[engines]]
            id = "broken"
            adapter = "http_json"
            "#,
        )
        .unwrap();
        assert!(matches!(
            build_registry(&config),
            Err(RegistryError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn test_duplicate_engine_ids_rejected() {
        let config = FederationConfig::from_toml_str(
            r#"
            [[engines]]
            id = "musicbrainz"
            adapter = "musicbrainz"

            [[engines]]
            id = "musicbrainz"
            adapter = "musicbrainz"
            "#,
        )
        .unwrap();
        assert_eq!(
            build_registry(&config).unwrap_err(),
            RegistryError::DuplicateSource("musicbrainz".into())
        );
    }
}
