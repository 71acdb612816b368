//! Derived display view: sort projection plus search filter

use std::collections::HashMap;
use std::sync::Arc;

use ranksync_api::{RankedItem, SearchFields, SortFields, SortSpec};
use serde::Serialize;

use crate::config::SearchConfig;
use crate::projection::project;
use crate::search::SearchIndex;
use crate::snapshot::CollectionSnapshot;

/// What the renderer shows
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedView<T> {
    pub snapshot_version: u64,
    pub sort: SortSpec,
    /// Active query, `None` when the view is unfiltered
    pub query: Option<String>,
    pub items: Vec<RankedItem<T>>,
    /// Size of the underlying collection
    pub total: usize,
}

impl<T> ProjectedView<T> {
    pub fn ids(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.id.as_str()).collect()
    }
}

/// Keeps the sort setting, query and search index for one session
#[derive(Debug)]
pub struct ViewProjector<T> {
    config: SearchConfig,
    sort: SortSpec,
    query: String,
    snapshot: Arc<CollectionSnapshot<T>>,
    index: SearchIndex,
}

impl<T: Clone + SortFields + SearchFields> ViewProjector<T> {
    pub fn new(config: SearchConfig, snapshot: Arc<CollectionSnapshot<T>>) -> Self {
        let index = SearchIndex::build(&snapshot);
        Self {
            config,
            sort: SortSpec::default(),
            query: String::new(),
            snapshot,
            index,
        }
    }

    pub fn sort(&self) -> SortSpec {
        self.sort
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn on_snapshot(&mut self, snapshot: Arc<CollectionSnapshot<T>>) {
        self.index = SearchIndex::build(&snapshot);
        self.snapshot = snapshot;
    }

    pub fn set_sort(&mut self, sort: SortSpec) {
        self.sort = sort;
    }

    pub fn set_query(&mut self, query: impl Into<String>) {
        self.query = query.into();
    }

    fn active_query(&self) -> Option<&str> {
        let trimmed = self.query.trim();
        (!trimmed.is_empty() && trimmed.chars().count() >= self.config.min_query_len)
            .then_some(trimmed)
    }

    pub fn render(&self) -> Arc<ProjectedView<T>> {
        let sorted = project(&self.snapshot.items, self.sort);

        let (query, items) = match self.active_query() {
            None => (None, sorted),
            Some(query) => {
                let hits = self.index.search(query, self.config.threshold);
                let scores: HashMap<&str, f64> = hits
                    .iter()
                    .map(|hit| (hit.item_id.as_str(), hit.score))
                    .collect();
                // Stable sort keeps the sorted order among equal scores
                let mut matched: Vec<(f64, RankedItem<T>)> = sorted
                    .into_iter()
                    .filter_map(|item| scores.get(item.id.as_str()).map(|score| (*score, item)))
                    .collect();
                matched.sort_by(|a, b| b.0.total_cmp(&a.0));
                (
                    Some(query.to_string()),
                    matched.into_iter().map(|(_, item)| item).collect(),
                )
            }
        };

        Arc::new(ProjectedView {
            snapshot_version: self.snapshot.version,
            sort: self.sort,
            query,
            items,
            total: self.snapshot.len(),
        })
    }
}
