//! Result normalizer
//!
//! Maps each adapter's payload items onto [`NormalizedResult`] using the
//! engine's [`FieldMapping`] (JSON pointers), then assigns a quality score.
//!
//! # Quality rubric
//! Each signal adds a bounded increment:
//! - direct external link: `link` (0.20)
//! - thumbnail: `thumbnail` (0.15)
//! - duration: `duration` (0.15)
//! - published date / year: `published` (0.10)
//! - per-source trust (0.0-1.0) scaled by `trust` (0.40)
//!
//! Weights summing above 1.0 are rescaled so the score stays in [0, 1].
//! Items without a usable title are dropped and counted.

use crate::types::{EngineDescriptor, EntityKind, NormalizedResult};
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Unit of numeric durations in a payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationUnit {
    #[default]
    Seconds,
    Millis,
}

/// JSON pointers locating each canonical field inside a payload item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMapping {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub duration: String,
    pub duration_unit: DurationUnit,
    pub published: String,
    pub link: String,
    pub thumbnail: String,
    pub id: String,
    pub kind: String,
    /// Kind assumed when the item carries none
    pub default_kind: EntityKind,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            title: "/title".to_string(),
            artist: "/artist".to_string(),
            album: "/album".to_string(),
            duration: "/duration".to_string(),
            duration_unit: DurationUnit::Seconds,
            published: "/published".to_string(),
            link: "/url".to_string(),
            thumbnail: "/thumbnail".to_string(),
            id: "/id".to_string(),
            kind: "/kind".to_string(),
            default_kind: EntityKind::Track,
        }
    }
}

/// Rubric weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub link: f64,
    pub thumbnail: f64,
    pub duration: f64,
    pub published: f64,
    pub trust: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            link: 0.20,
            thumbnail: 0.15,
            duration: 0.15,
            published: 0.10,
            trust: 0.40,
        }
    }
}

impl QualityWeights {
    /// Clamp negatives to zero and rescale so the weights sum to at most 1.0
    fn bounded(&self) -> Self {
        let parts = [self.link, self.thumbnail, self.duration, self.published, self.trust]
            .map(|w| if w.is_finite() { w.max(0.0) } else { 0.0 });
        let sum: f64 = parts.iter().sum();
        let scale = if sum > 1.0 { 1.0 / sum } else { 1.0 };
        Self {
            link: parts[0] * scale,
            thumbnail: parts[1] * scale,
            duration: parts[2] * scale,
            published: parts[3] * scale,
            trust: parts[4] * scale,
        }
    }
}

/// Output of normalizing one source's payload
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub results: Vec<NormalizedResult>,
    /// Malformed items (no title) that were discarded
    pub dropped: usize,
}

impl NormalizedBatch {
    /// Every item was malformed
    pub fn all_malformed(&self) -> bool {
        self.results.is_empty() && self.dropped > 0
    }
}

pub struct Normalizer {
    weights: QualityWeights,
    trust: HashMap<String, f64>,
    default_trust: f64,
}

impl Normalizer {
    pub fn new(weights: QualityWeights, trust: HashMap<String, f64>, default_trust: f64) -> Self {
        Self {
            weights: weights.bounded(),
            trust: trust
                .into_iter()
                .map(|(k, v)| (k, v.clamp(0.0, 1.0)))
                .collect(),
            default_trust: default_trust.clamp(0.0, 1.0),
        }
    }

    pub fn trust_for(&self, source: &str) -> f64 {
        self.trust.get(source).copied().unwrap_or(self.default_trust)
    }

    /// Normalize all payload items from one source
    pub fn normalize(&self, descriptor: &EngineDescriptor, items: &[Value]) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        for (position, item) in items.iter().enumerate() {
            match self.normalize_item(descriptor, item, position) {
                Some(result) => batch.results.push(result),
                None => batch.dropped += 1,
            }
        }
        if batch.dropped > 0 {
            debug!(
                source = %descriptor.id,
                dropped = batch.dropped,
                kept = batch.results.len(),
                "Dropped malformed payload items"
            );
        }
        batch
    }

    fn normalize_item(
        &self,
        descriptor: &EngineDescriptor,
        item: &Value,
        position: usize,
    ) -> Option<NormalizedResult> {
        let fields = &descriptor.fields;
        let title = text_at(item, &fields.title)?;

        let link = text_at(item, &fields.link).filter(|l| is_http_url(l));
        let thumbnail = text_at(item, &fields.thumbnail).filter(|t| is_http_url(t));
        let duration_secs = item
            .pointer(&fields.duration)
            .and_then(|v| parse_duration(v, fields.duration_unit));
        let published = item.pointer(&fields.published).and_then(parse_published);
        let kind = text_at(item, &fields.kind)
            .and_then(|k| EntityKind::from_label(&k))
            .unwrap_or(fields.default_kind);

        // Source-local id: explicit id, else link, else payload position
        let source_id = text_at(item, &fields.id)
            .or_else(|| link.clone())
            .unwrap_or_else(|| format!("#{}", position));

        let mut result = NormalizedResult {
            kind,
            title,
            artist: text_at(item, &fields.artist),
            album: text_at(item, &fields.album),
            duration_secs,
            published,
            link,
            thumbnail,
            source: descriptor.id.clone(),
            source_id,
            quality: 0.0,
        };
        result.quality = self.quality(&result);
        Some(result)
    }

    /// Score a record against the rubric
    pub fn quality(&self, result: &NormalizedResult) -> f64 {
        let w = &self.weights;
        let mut score = 0.0;
        if result.link.is_some() {
            score += w.link;
        }
        if result.thumbnail.is_some() {
            score += w.thumbnail;
        }
        if result.duration_secs.is_some() {
            score += w.duration;
        }
        if result.published.is_some() {
            score += w.published;
        }
        score += w.trust * self.trust_for(&result.source);
        score.clamp(0.0, 1.0)
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(QualityWeights::default(), HashMap::new(), 0.5)
    }
}

/// Non-empty trimmed text (numbers are rendered as text)
fn text_at(item: &Value, pointer: &str) -> Option<String> {
    if pointer.is_empty() {
        return None;
    }
    let text = match item.pointer(pointer)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn is_http_url(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    (lower.starts_with("https://") || lower.starts_with("http://")) && value.len() > "http://".len()
}

/// Accepts numbers, numeric strings, and "m:ss" / "h:mm:ss"
fn parse_duration(value: &Value, unit: DurationUnit) -> Option<u32> {
    let scale = |raw: f64| match unit {
        DurationUnit::Seconds => raw,
        DurationUnit::Millis => raw / 1000.0,
    };
    let seconds = match value {
        Value::Number(n) => scale(n.as_f64()?),
        Value::String(s) => {
            let s = s.trim();
            if s.contains(':') {
                let mut total = 0.0;
                for part in s.split(':') {
                    let part: u32 = part.trim().parse().ok()?;
                    total = total * 60.0 + f64::from(part);
                }
                total
            } else {
                scale(s.parse::<f64>().ok()?)
            }
        }
        _ => return None,
    };
    (seconds.is_finite() && seconds > 0.0 && seconds < f64::from(u32::MAX))
        .then(|| seconds.round() as u32)
}

/// Accepts RFC 3339, "YYYY-MM-DD", "YYYY-MM", "YYYY", or a bare year number
fn parse_published(value: &Value) -> Option<NaiveDate> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.as_u64()?.to_string(),
        _ => return None,
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(&text) {
        return Some(dt.date_naive());
    }
    if let Ok(date) = NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
        return Some(date);
    }
    let mut parts = text.splitn(3, '-');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u32 = match parts.next() {
        Some(m) => m.parse().ok()?,
        None => 1,
    };
    if !(1000..=9999).contains(&year) {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor(id: &str) -> EngineDescriptor {
        EngineDescriptor::new(id)
    }

    #[test]
    fn test_full_item_maps_all_fields() {
        let normalizer = Normalizer::default();
        let item = json!({
            "id": 42,
            "title": "  No Man's Land ",
            "artist": "Artist A",
            "album": "Frontier",
            "duration": "3:30",
            "published": "2019-04-12T00:00:00Z",
            "url": "https://example.com/t/42",
            "thumbnail": "https://img.example.com/42.jpg",
            "kind": "song"
        });

        let batch = normalizer.normalize(&descriptor("x"), &[item]);
        assert_eq!(batch.dropped, 0);
        let result = &batch.results[0];
        assert_eq!(result.title, "No Man's Land");
        assert_eq!(result.source_id, "42");
        assert_eq!(result.duration_secs, Some(210));
        assert_eq!(result.published, NaiveDate::from_ymd_opt(2019, 4, 12));
        assert_eq!(result.kind, EntityKind::Track);
        // 0.2 + 0.15 + 0.15 + 0.1 + 0.4 * 0.5
        assert!((result.quality - 0.80).abs() < 1e-9);
    }

    #[test]
    fn test_missing_title_dropped() {
        let normalizer = Normalizer::default();
        let items = vec![
            json!({"artist": "nobody"}),
            json!({"title": "   "}),
            json!({"title": "Kept"}),
        ];
        let batch = normalizer.normalize(&descriptor("x"), &items);
        assert_eq!(batch.dropped, 2);
        assert_eq!(batch.results.len(), 1);
        assert!(!batch.all_malformed());
    }

    #[test]
    fn test_thumbnail_raises_quality() {
        let normalizer = Normalizer::default();
        let with = json!({"title": "t", "thumbnail": "https://i/1.jpg"});
        let without = json!({"title": "t"});
        let batch = normalizer.normalize(&descriptor("x"), &[with, without]);
        assert!(batch.results[0].quality > batch.results[1].quality);
    }

    #[test]
    fn test_trust_weight_per_source() {
        let mut trust = HashMap::new();
        trust.insert("musicbrainz".to_string(), 1.0);
        let normalizer = Normalizer::new(QualityWeights::default(), trust, 0.0);
        let item = json!({"title": "t"});

        let trusted = normalizer.normalize(&descriptor("musicbrainz"), &[item.clone()]);
        let unknown = normalizer.normalize(&descriptor("scraper"), &[item]);
        assert!((trusted.results[0].quality - 0.4).abs() < 1e-9);
        assert_eq!(unknown.results[0].quality, 0.0);
    }

    #[test]
    fn test_oversized_weights_stay_bounded() {
        let weights = QualityWeights {
            link: 1.0,
            thumbnail: 1.0,
            duration: 1.0,
            published: 1.0,
            trust: 1.0,
        };
        let normalizer = Normalizer::new(weights, HashMap::new(), 1.0);
        let item = json!({
            "title": "t", "url": "https://a/b", "thumbnail": "https://a/c",
            "duration": 100, "published": 1999
        });
        let batch = normalizer.normalize(&descriptor("x"), &[item]);
        let q = batch.results[0].quality;
        assert!(q <= 1.0 && q > 0.99);
    }

    #[test]
    fn test_millisecond_durations_and_custom_pointers() {
        let normalizer = Normalizer::default();
        let mut desc = descriptor("mb");
        desc.fields.title = "/name".into();
        desc.fields.duration = "/length".into();
        desc.fields.duration_unit = DurationUnit::Millis;
        let item = json!({"name": "Song", "length": 208_400});
        let batch = normalizer.normalize(&desc, &[item]);
        assert_eq!(batch.results[0].duration_secs, Some(208));
    }

    #[test]
    fn test_non_http_link_ignored_and_position_id() {
        let normalizer = Normalizer::default();
        let item = json!({"title": "t", "url": "javascript:alert(1)"});
        let batch = normalizer.normalize(&descriptor("x"), &[json!({"title": "a"}), item]);
        assert!(batch.results[1].link.is_none());
        assert_eq!(batch.results[1].source_id, "#1");
    }

    #[test]
    fn test_published_formats() {
        assert_eq!(parse_published(&json!("2001")), NaiveDate::from_ymd_opt(2001, 1, 1));
        assert_eq!(parse_published(&json!("2001-07")), NaiveDate::from_ymd_opt(2001, 7, 1));
        assert_eq!(parse_published(&json!(1987)), NaiveDate::from_ymd_opt(1987, 1, 1));
        assert_eq!(parse_published(&json!("someday")), None);
    }

    #[test]
    fn test_duration_formats() {
        assert_eq!(parse_duration(&json!("1:02:03"), DurationUnit::Seconds), Some(3723));
        assert_eq!(parse_duration(&json!("208"), DurationUnit::Seconds), Some(208));
        assert_eq!(parse_duration(&json!(0), DurationUnit::Seconds), None);
        assert_eq!(parse_duration(&json!("x:10"), DurationUnit::Seconds), None);
    }
}
