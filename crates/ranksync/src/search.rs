//! Fuzzy search over snapshot payloads
//!
//! The index is rebuilt from scratch for every snapshot, which is linear in
//! the collection size. Fine for playlists; large collections would want an
//! incremental index.

use ranksync_api::{ItemId, SearchFields};
use strsim::jaro_winkler;

use crate::snapshot::CollectionSnapshot;

const EXACT_SCORE: f64 = 1.0;
const PREFIX_SCORE: f64 = 0.98;
const CONTAINS_SCORE: f64 = 0.95;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub item_id: ItemId,
    pub score: f64,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    item_id: ItemId,
    /// Lowercased searchable fields
    fields: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchIndex {
    version: u64,
    entries: Vec<IndexEntry>,
}

impl SearchIndex {
    pub fn build<T: SearchFields>(snapshot: &CollectionSnapshot<T>) -> Self {
        let entries = snapshot
            .items
            .iter()
            .map(|item| IndexEntry {
                item_id: item.id.clone(),
                fields: item
                    .payload
                    .search_fields()
                    .into_iter()
                    .filter(|field| !field.trim().is_empty())
                    .map(str::to_lowercase)
                    .collect(),
            })
            .collect();
        Self {
            version: snapshot.version,
            entries,
        }
    }

    /// Version of the snapshot this index was built from
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Items scoring at least `threshold`, best match first.
    ///
    /// Hits with equal scores keep index (rank) order.
    pub fn search(&self, query: &str, threshold: f64) -> Vec<SearchHit> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<SearchHit> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let score = entry
                    .fields
                    .iter()
                    .map(|field| field_score(&query, field))
                    .fold(0.0_f64, f64::max);
                (score >= threshold).then(|| SearchHit {
                    item_id: entry.item_id.clone(),
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits
    }
}

fn field_score(query: &str, field: &str) -> f64 {
    if field == query {
        return EXACT_SCORE;
    }
    if field.starts_with(query) {
        return PREFIX_SCORE;
    }
    if field.contains(query) {
        return CONTAINS_SCORE;
    }
    field
        .split_whitespace()
        .map(|token| jaro_winkler(query, token))
        .fold(jaro_winkler(query, field), f64::max)
}
