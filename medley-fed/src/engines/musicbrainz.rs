//! MusicBrainz recording search
//!
//! API documentation: https://musicbrainz.org/doc/MusicBrainz_API
//!
//! MusicBrainz asks clients for at most 1 request/second and a descriptive
//! User-Agent. The shared token bucket enforces the declared limit across
//! processes; the local `governor` quota, shaped by the same declared limit,
//! refuses (rather than waits) if this process alone would exceed it.

use super::{build_client, fetch_within, get_json, HttpError};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::RegistryError;
use crate::normalize::{DurationUnit, FieldMapping};
use crate::types::{
    AdapterFailure, Capabilities, EngineDescriptor, FailureKind, Query, RateLimit, RawResult,
};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Deserialize;
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://musicbrainz.org/ws/2";
const DEFAULT_USER_AGENT: &str = concat!(
    "medley/",
    env!("CARGO_PKG_VERSION"),
    " ( https://github.com/medley-music/medley )"
);
const WEB_BASE_URL: &str = "https://musicbrainz.org";
const COVER_ART_BASE_URL: &str = "https://coverartarchive.org";

#[derive(Debug, Deserialize)]
struct MbSearchResponse {
    #[serde(default)]
    recordings: Vec<MbRecording>,
}

#[derive(Debug, Deserialize)]
struct MbRecording {
    id: String,
    #[serde(default)]
    title: String,
    /// Milliseconds
    length: Option<u64>,
    #[serde(rename = "artist-credit", default)]
    artist_credit: Vec<MbArtistCredit>,
    #[serde(default)]
    releases: Vec<MbRelease>,
    #[serde(rename = "first-release-date")]
    first_release_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MbArtistCredit {
    name: String,
    #[serde(default)]
    joinphrase: String,
}

#[derive(Debug, Deserialize)]
struct MbRelease {
    id: String,
    title: String,
    date: Option<String>,
}

pub struct MusicBrainzEngine {
    descriptor: EngineDescriptor,
    client: reqwest::Client,
    base_url: String,
    page_size: u32,
    quota: DefaultDirectRateLimiter,
}

impl MusicBrainzEngine {
    /// 1 req/s, 5s timeout, paging, catalog class
    pub fn default_descriptor(id: &str) -> EngineDescriptor {
        EngineDescriptor {
            timeout: Duration::from_secs(5),
            rate_limit: RateLimit::per_second(1),
            capabilities: Capabilities {
                paging: true,
                requires_credential: false,
            },
            fields: FieldMapping {
                duration_unit: DurationUnit::Millis,
                ..FieldMapping::default()
            },
            ..EngineDescriptor::new(id)
        }
    }

    pub fn new(descriptor: EngineDescriptor, config: &EngineConfig) -> Result<Self, RegistryError> {
        let user_agent = config.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT);
        Ok(Self {
            client: build_client(&config.id, user_agent)?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            page_size: config.page_size.clamp(1, 100),
            quota: RateLimiter::direct(local_quota(&descriptor.rate_limit)),
            descriptor,
        })
    }

    pub fn search_url(&self, text: &str, page: u32) -> String {
        let offset = page.saturating_sub(1).saturating_mul(self.page_size);
        format!(
            "{}/recording?query={}&fmt=json&limit={}&offset={}",
            self.base_url,
            urlencoding::encode(text.trim()),
            self.page_size,
            offset
        )
    }

    async fn exchange(&self, url: String) -> Result<Vec<Value>, HttpError> {
        debug!(url = %url, "Querying MusicBrainz");
        let body = get_json(self.client.get(&url)).await?;
        recording_items(body).map_err(HttpError::Failed)
    }
}

/// `requests` per `window` as a burst of `requests` refilled one cell at a time
fn local_quota(limit: &RateLimit) -> Quota {
    let burst = NonZeroU32::new(limit.requests).unwrap_or(NonZeroU32::MIN);
    let period = (limit.window / burst.get()).max(Duration::from_millis(1));
    Quota::with_period(period)
        .map(|quota| quota.allow_burst(burst))
        .unwrap_or_else(|| Quota::per_second(burst))
}

/// Reshape a recording search response into uniform payload items
pub fn recording_items(body: Value) -> Result<Vec<Value>, AdapterFailure> {
    let response: MbSearchResponse = serde_json::from_value(body)
        .map_err(|e| AdapterFailure::new(FailureKind::Parse, e.to_string()))?;

    Ok(response
        .recordings
        .into_iter()
        .map(|recording| {
            let artist: String = recording
                .artist_credit
                .iter()
                .map(|credit| format!("{}{}", credit.name, credit.joinphrase))
                .collect();
            let release = recording.releases.first();
            let url = format!("{}/recording/{}", WEB_BASE_URL, recording.id);
            let published = recording
                .first_release_date
                .clone()
                .or_else(|| release.and_then(|r| r.date.clone()));

            json!({
                "id": recording.id,
                "kind": "recording",
                "title": recording.title,
                "artist": artist,
                "album": release.map(|r| r.title.clone()),
                "duration": recording.length,
                "published": published,
                "url": url,
                "thumbnail": release.map(|r| format!("{}/release/{}/front-250", COVER_ART_BASE_URL, r.id)),
            })
        })
        .collect())
}

#[async_trait]
impl Engine for MusicBrainzEngine {
    fn describe(&self) -> EngineDescriptor {
        self.descriptor.clone()
    }

    async fn fetch(&self, query: &Query, page: u32) -> RawResult {
        if self.quota.check().is_err() {
            return RawResult::failure(
                self.descriptor.id.clone(),
                Duration::ZERO,
                AdapterFailure::new(FailureKind::Throttled, "local MusicBrainz quota exhausted"),
            );
        }
        let url = self.search_url(&query.text, page);
        fetch_within(&self.descriptor.id, self.descriptor.timeout, self.exchange(url)).await
    }
}
