//! Configurable REST/JSON adapter
//!
//! Covers the common "GET a search URL, read an array of objects" shape.
//! Field mapping happens later in the normalizer, so this adapter only
//! locates the result array.

use super::{build_client, fetch_within, get_json, HttpError};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::RegistryError;
use crate::types::{AdapterFailure, EngineDescriptor, FailureKind, Query, RawResult};
use async_trait::async_trait;
use serde_json::Value;

const USER_AGENT: &str = concat!("medley/", env!("CARGO_PKG_VERSION"));

pub struct HttpJsonEngine {
    descriptor: EngineDescriptor,
    client: reqwest::Client,
    url_template: String,
    results_pointer: String,
    /// (header name, key)
    api_key: Option<(String, String)>,
    page_size: u32,
}

impl HttpJsonEngine {
    /// Descriptor derived from the engine's config entry
    pub fn descriptor_for(config: &EngineConfig) -> EngineDescriptor {
        let mut descriptor = EngineDescriptor::new(config.id.clone());
        descriptor.fields = config.fields.clone();
        descriptor.capabilities.requires_credential = config.api_key_header.is_some();
        descriptor
    }

    pub fn new(descriptor: EngineDescriptor, config: &EngineConfig) -> Result<Self, RegistryError> {
        let url_template = config
            .url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| RegistryError::InvalidDescriptor {
                id: config.id.clone(),
                reason: "http_json engine needs a url".to_string(),
            })?;

        let api_key = match (&config.api_key_header, &config.credential) {
            (Some(header), Some(key)) => Some((header.clone(), key.clone())),
            _ => None,
        };

        let user_agent = config.user_agent.as_deref().unwrap_or(USER_AGENT);
        Ok(Self {
            client: build_client(&config.id, user_agent)?,
            url_template,
            results_pointer: config.results_pointer.clone(),
            api_key,
            page_size: config.page_size.max(1),
            descriptor,
        })
    }

    /// Expand `{query}`, `{page}` and `{offset}`
    pub fn build_url(&self, text: &str, page: u32) -> String {
        let offset = page.saturating_sub(1).saturating_mul(self.page_size);
        self.url_template
            .replace("{query}", &urlencoding::encode(text.trim()))
            .replace("{page}", &page.to_string())
            .replace("{offset}", &offset.to_string())
    }

    async fn exchange(&self, url: String) -> Result<Vec<Value>, HttpError> {
        let mut request = self.client.get(&url);
        if let Some((header, key)) = &self.api_key {
            request = request.header(header.as_str(), key.as_str());
        }
        let body = get_json(request).await?;
        extract_items(&body, &self.results_pointer).map_err(HttpError::Failed)
    }
}

/// Locate the result array inside a response body
///
/// A missing or `null` array is an empty result set; any other
/// non-array value is a parse failure.
pub fn extract_items(body: &Value, pointer: &str) -> Result<Vec<Value>, AdapterFailure> {
    let target = if pointer.is_empty() {
        Some(body)
    } else {
        body.pointer(pointer)
    };
    match target {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => Err(AdapterFailure::new(
            FailureKind::Parse,
            format!("expected array at '{}', found {}", pointer, type_name(other)),
        )),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[async_trait]
impl Engine for HttpJsonEngine {
    fn describe(&self) -> EngineDescriptor {
        self.descriptor.clone()
    }

    async fn fetch(&self, query: &Query, page: u32) -> RawResult {
        let url = self.build_url(&query.text, page);
        fetch_within(&self.descriptor.id, self.descriptor.timeout, self.exchange(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FederationConfig;
    use serde_json::json;

    fn engine(toml: &str) -> HttpJsonEngine {
        let config = FederationConfig::from_toml_str(toml).unwrap();
        let entry = &config.engines[0];
        HttpJsonEngine::new(HttpJsonEngine::descriptor_for(entry), entry).unwrap()
    }

    #[test]
    fn test_build_url_encodes_query_and_offsets() {
        let engine = engine(
            r#"
            [[engines]]
            id = "deezer"
            adapter = "http_json"
            url = "https://api.example/search?q={query}&index={offset}&p={page}"
            page_size = 20
            "#,
        );
        assert_eq!(
            engine.build_url(" no man's land ", 3),
            "https://api.example/search?q=no%20man%27s%20land&index=40&p=3"
        );
    }

    #[test]
    fn test_extract_items() {
        let body = json!({"data": [{"title": "a"}, {"title": "b"}], "total": 2});
        assert_eq!(extract_items(&body, "/data").unwrap().len(), 2);
        assert!(extract_items(&body, "/missing").unwrap().is_empty());
        assert_eq!(
            extract_items(&body, "/total").unwrap_err().kind,
            FailureKind::Parse
        );
        assert_eq!(extract_items(&json!([1, 2, 3]), "").unwrap().len(), 3);
    }

    #[test]
    fn test_api_key_only_with_credential() {
        let engine = engine(
            r#"
            [[engines]]
            id = "keyed"
            adapter = "http_json"
            url = "https://api.example/?q={query}"
            api_key_header = "X-Api-Key"
            credential = "secret"
            "#,
        );
        assert_eq!(
            engine.api_key,
            Some(("X-Api-Key".to_string(), "secret".to_string()))
        );
        assert!(engine.describe().capabilities.requires_credential);
    }
}
