//! Ranked item types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a single item inside a collection
pub type ItemId = String;

/// Identifier of the parent entity that owns a collection (e.g. a playlist)
pub type ParentId = String;

/// 1-based position of an item within its parent collection
pub type Rank = usize;

/// One entry of a rank-ordered collection.
///
/// Items sharing a `parent_id` form a collection whose ranks are dense:
/// for N items the ranks are exactly `1..=N`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedItem<T> {
    pub id: ItemId,
    pub parent_id: ParentId,
    pub rank: Rank,
    pub payload: T,
    pub created_at: DateTime<Utc>,
}

impl<T> RankedItem<T> {
    pub fn new(
        id: impl Into<ItemId>,
        parent_id: impl Into<ParentId>,
        rank: Rank,
        payload: T,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id: parent_id.into(),
            rank,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Same item at a different rank
    pub fn with_rank(mut self, rank: Rank) -> Self {
        self.rank = rank;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}
