//! Entity Reconciler - cross-source merge into canonical entities
//!
//! Two results are merge candidates when:
//! - they have the same entity kind and normalized title (diacritics and
//!   punctuation stripped, case folded), and
//! - their normalized artists match, or exactly one side has no artist, and
//! - if both declare a duration, the durations differ by at most the tolerance.
//!
//! The missing-artist allowance covers one side only: two artist-less
//! results never merge, even with equal titles, since a title alone does
//! not identify a track.
//!
//! Candidates are joined with union-find. A union is refused when it would
//! put two different artists, or durations spanning more than the tolerance,
//! into one component, so an artist-less record cannot bridge two
//! unrelated tracks. A missed merge shows a duplicate; a false merge hides a
//! track, so ambiguity always resolves to "no merge".
//!
//! Confidence formula: `min(1, mean_quality * (1 + bonus)^(distinct_sources - 1))`

use crate::types::{CanonicalEntity, EntityKind, NormalizedResult, Provenance};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Merge policy
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Max duration difference (inclusive) for a merge
    pub duration_tolerance_secs: u32,
    /// Confidence boost per additional agreeing source
    pub corroboration_bonus: f64,
    /// Primary-record tie-break order; unlisted sources follow in declaration order
    pub source_priority: Vec<String>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            duration_tolerance_secs: 3,
            corroboration_bonus: 0.15,
            source_priority: Vec::new(),
        }
    }
}

/// Case-fold, strip diacritics and punctuation, collapse whitespace
pub fn normalize_text(input: &str) -> String {
    let folded: String = input
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Matching view of one result
struct MatchKey {
    title: String,
    artist: Option<String>,
}

/// Union-find component summary used to refuse conflicting unions
#[derive(Clone)]
struct Component {
    artist: Option<String>,
    min_duration: Option<u32>,
    max_duration: Option<u32>,
}

struct DisjointSet {
    parent: Vec<usize>,
    components: Vec<Component>,
}

impl DisjointSet {
    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }
}

pub struct Reconciler {
    tolerance: u32,
    bonus: f64,
    priority: HashMap<String, usize>,
    declaration: HashMap<String, usize>,
}

impl Reconciler {
    /// `declaration_order` is the registry's source order
    pub fn new(config: &ReconcileConfig, declaration_order: &[String]) -> Self {
        let mut priority = HashMap::new();
        for source in &config.source_priority {
            let next = priority.len();
            priority.entry(source.clone()).or_insert(next);
        }
        let declaration = declaration_order
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i))
            .collect();
        Self {
            tolerance: config.duration_tolerance_secs,
            bonus: config.corroboration_bonus.max(0.0),
            priority,
            declaration,
        }
    }

    fn declaration_rank(&self, source: &str) -> usize {
        self.declaration.get(source).copied().unwrap_or(usize::MAX)
    }

    fn priority_rank(&self, source: &str) -> usize {
        match self.priority.get(source) {
            Some(&rank) => rank,
            None => self.priority.len().saturating_add(self.declaration_rank(source)),
        }
    }

    /// Merge one query's normalized results into sorted canonical entities
    pub fn reconcile(&self, mut results: Vec<NormalizedResult>) -> Vec<CanonicalEntity> {
        // Fixed processing order makes the outcome independent of arrival order
        results.sort_by(|a, b| self.canonical_cmp(a, b));

        let keys: Vec<MatchKey> = results
            .iter()
            .map(|r| MatchKey {
                title: normalize_text(&r.title),
                artist: r
                    .artist
                    .as_deref()
                    .map(normalize_text)
                    .filter(|a| !a.is_empty()),
            })
            .collect();

        let mut set = DisjointSet {
            parent: (0..results.len()).collect(),
            components: results
                .iter()
                .zip(&keys)
                .map(|(r, k)| Component {
                    artist: k.artist.clone(),
                    min_duration: r.duration_secs,
                    max_duration: r.duration_secs,
                })
                .collect(),
        };

        // Block on (kind, title); only results in one block can merge
        let mut blocks: BTreeMap<(EntityKind, &str), Vec<usize>> = BTreeMap::new();
        for (idx, key) in keys.iter().enumerate() {
            if !key.title.is_empty() {
                blocks
                    .entry((results[idx].kind, key.title.as_str()))
                    .or_default()
                    .push(idx);
            }
        }

        for members in blocks.values() {
            for (pos, &a) in members.iter().enumerate() {
                for &b in &members[pos + 1..] {
                    if self.is_candidate(&results[a], &keys[a], &results[b], &keys[b]) {
                        self.try_union(&mut set, a, b);
                    }
                }
            }
        }

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for idx in 0..results.len() {
            let root = set.find(idx);
            groups.entry(root).or_default().push(idx);
        }

        let mut entities: Vec<CanonicalEntity> = groups
            .into_values()
            .map(|members| {
                let root = set.find(members[0]);
                let artist = set.components[root].artist.clone();
                self.build_entity(&results, &keys[members[0]].title, artist, members)
            })
            .collect();

        entities.sort_by(|a, b| self.entity_cmp(a, b));

        debug!(
            inputs = results.len(),
            entities = entities.len(),
            "Reconciliation complete"
        );
        entities
    }

    fn is_candidate(
        &self,
        a: &NormalizedResult,
        ka: &MatchKey,
        b: &NormalizedResult,
        kb: &MatchKey,
    ) -> bool {
        let artists_ok = match (&ka.artist, &kb.artist) {
            (Some(x), Some(y)) => x == y,
            (Some(_), None) | (None, Some(_)) => true,
            // Two artist-less records are too ambiguous to merge
            (None, None) => false,
        };
        if !artists_ok {
            return false;
        }
        match (a.duration_secs, b.duration_secs) {
            (Some(x), Some(y)) => x.abs_diff(y) <= self.tolerance,
            _ => true,
        }
    }

    fn try_union(&self, set: &mut DisjointSet, a: usize, b: usize) {
        let (ra, rb) = (set.find(a), set.find(b));
        if ra == rb {
            return;
        }
        let (ca, cb) = (&set.components[ra], &set.components[rb]);

        let artist = match (&ca.artist, &cb.artist) {
            (Some(x), Some(y)) if x != y => {
                debug!(left = %x, right = %y, "Refused merge bridging different artists");
                return;
            }
            (Some(x), _) | (None, Some(x)) => Some(x.clone()),
            (None, None) => None,
        };

        let min_duration = min_opt(ca.min_duration, cb.min_duration);
        let max_duration = max_opt(ca.max_duration, cb.max_duration);
        if let (Some(lo), Some(hi)) = (min_duration, max_duration) {
            if hi - lo > self.tolerance {
                debug!(lo, hi, "Refused merge spanning durations beyond tolerance");
                return;
            }
        }

        let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
        set.parent[child] = root;
        set.components[root] = Component {
            artist,
            min_duration,
            max_duration,
        };
    }

    fn build_entity(
        &self,
        results: &[NormalizedResult],
        title_key: &str,
        artist_key: Option<String>,
        members: Vec<usize>,
    ) -> CanonicalEntity {
        let mut members: Vec<&NormalizedResult> = members.iter().map(|&i| &results[i]).collect();
        members.sort_by(|a, b| {
            self.priority_rank(&a.source)
                .cmp(&self.priority_rank(&b.source))
                .then_with(|| a.source_id.cmp(&b.source_id))
        });

        // Highest quality wins; ties go to source priority (members are in priority order)
        let mut primary = members[0];
        for candidate in &members[1..] {
            if candidate.quality > primary.quality {
                primary = *candidate;
            }
        }

        let distinct_sources: BTreeSet<&str> = members.iter().map(|m| m.source.as_str()).collect();
        let mean = members.iter().map(|m| m.quality).sum::<f64>() / members.len() as f64;
        let boost = (1.0 + self.bonus).powi(distinct_sources.len() as i32 - 1);
        let confidence = (mean * boost).clamp(0.0, 1.0);

        let provenance = members
            .iter()
            .map(|m| Provenance {
                source: m.source.clone(),
                source_id: m.source_id.clone(),
                contribution: m.quality,
            })
            .collect();

        CanonicalEntity {
            id: entity_id(primary, title_key, artist_key.as_deref()),
            kind: primary.kind,
            primary: primary.clone(),
            provenance,
            confidence,
        }
    }

    /// Total order over inputs, independent of arrival order
    fn canonical_cmp(&self, a: &NormalizedResult, b: &NormalizedResult) -> Ordering {
        self.declaration_rank(&a.source)
            .cmp(&self.declaration_rank(&b.source))
            .then_with(|| a.source.cmp(&b.source))
            .then_with(|| a.source_id.cmp(&b.source_id))
            .then_with(|| a.title.cmp(&b.title))
            .then_with(|| a.artist.cmp(&b.artist))
            .then_with(|| a.duration_secs.cmp(&b.duration_secs))
            .then_with(|| b.quality.total_cmp(&a.quality))
    }

    fn entity_cmp(&self, a: &CanonicalEntity, b: &CanonicalEntity) -> Ordering {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| b.primary.quality.total_cmp(&a.primary.quality))
            .then_with(|| {
                self.declaration_rank(&a.primary.source)
                    .cmp(&self.declaration_rank(&b.primary.source))
            })
            .then_with(|| a.primary.source_id.cmp(&b.primary.source_id))
            .then_with(|| a.id.cmp(&b.id))
    }
}

fn min_opt(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn max_opt(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn entity_id(primary: &NormalizedResult, title_key: &str, artist_key: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    for part in [
        primary.kind.as_str(),
        title_key,
        artist_key.unwrap_or(""),
        &primary.source,
        &primary.source_id,
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}
