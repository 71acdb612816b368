use ranksync_api::{ParentId, RankedItem};
use serde::{Deserialize, Serialize};

/// Immutable, rank-ordered view of a collection at one point in time.
///
/// Published by the engine after every processed input that changed the
/// store. `version` increases with every publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSnapshot<T> {
    pub parent_id: ParentId,
    pub version: u64,
    pub items: Vec<RankedItem<T>>,
}

impl<T> CollectionSnapshot<T> {
    pub fn empty(parent_id: impl Into<ParentId>) -> Self {
        Self {
            parent_id: parent_id.into(),
            version: 0,
            items: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Item ids in display order
    pub fn ids(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.id.as_str()).collect()
    }

    pub fn get(&self, item_id: &str) -> Option<&RankedItem<T>> {
        self.items.iter().find(|item| item.id == item_id)
    }
}
