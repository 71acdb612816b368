//! Owned, rank-ordered item storage for one parent collection
//!
//! The store holds the canonical ordering. Its read side (`snapshot`, `get`)
//! is public; its mutators are crate-private so every change goes through
//! the reconciliation engine, which is the only place allowed to decide how
//! ranks shift.
//!
//! Invariants after every mutator returns:
//! - ranks are exactly `1..=len` (dense, no duplicates)
//! - `items` is sorted by rank ascending

use std::collections::HashSet;

use ranksync_api::{ApiError, ParentId, Rank, RankedItem};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("item not found: {id}")]
    NotFound { id: String },

    #[error("rank {rank} outside 1..={max}")]
    RankOutOfRange { rank: Rank, max: Rank },

    #[error("duplicate item id: {id}")]
    DuplicateId { id: String },

    #[error("ranks are not dense: expected rank {expected}, found {found}")]
    NotDense { expected: Rank, found: Rank },

    #[error("item {id} belongs to parent {found}, expected {expected}")]
    ParentMismatch {
        id: String,
        expected: String,
        found: String,
    },
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { id } => ApiError::MissingItem { id },
            StoreError::RankOutOfRange { .. } => ApiError::Validation {
                message: err.to_string(),
            },
            other => ApiError::InvalidSnapshot {
                message: other.to_string(),
            },
        }
    }
}

/// Rank-ordered collection of items sharing one parent id.
#[derive(Debug, Clone)]
pub struct RankedCollectionStore<T> {
    parent_id: ParentId,
    items: Vec<RankedItem<T>>,
}

impl<T: Clone> RankedCollectionStore<T> {
    pub fn new(parent_id: impl Into<ParentId>) -> Self {
        Self {
            parent_id: parent_id.into(),
            items: Vec::new(),
        }
    }

    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Replace the whole collection.
    ///
    /// Input may arrive in any order but must already be dense once sorted
    /// by rank. On error the store is left untouched.
    pub fn load(&mut self, mut items: Vec<RankedItem<T>>) -> Result<(), StoreError> {
        items.sort_by_key(|item| item.rank);

        let mut seen = HashSet::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            if item.parent_id != self.parent_id {
                return Err(StoreError::ParentMismatch {
                    id: item.id.clone(),
                    expected: self.parent_id.clone(),
                    found: item.parent_id.clone(),
                });
            }
            if item.rank != index + 1 {
                return Err(StoreError::NotDense {
                    expected: index + 1,
                    found: item.rank,
                });
            }
            if !seen.insert(item.id.as_str()) {
                return Err(StoreError::DuplicateId {
                    id: item.id.clone(),
                });
            }
        }

        self.items = items;
        Ok(())
    }

    /// Rank-ordered copy of the collection
    pub fn snapshot(&self) -> Vec<RankedItem<T>> {
        self.items.clone()
    }

    pub fn get(&self, item_id: &str) -> Option<&RankedItem<T>> {
        self.items.iter().find(|item| item.id == item_id)
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.get(item_id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RankedItem<T>> {
        self.items.iter()
    }

    /// Whether ranks are exactly `1..=len` in order
    pub fn is_dense(&self) -> bool {
        self.items
            .iter()
            .enumerate()
            .all(|(index, item)| item.rank == index + 1)
    }

    /// Insert `item` at `item.rank`, shifting every item at or after it down one slot
    pub(crate) fn insert_at(&mut self, item: RankedItem<T>) -> Result<(), StoreError> {
        let rank = item.rank;
        let max = self.items.len() + 1;
        if rank == 0 || rank > max {
            return Err(StoreError::RankOutOfRange { rank, max });
        }
        if self.contains(&item.id) {
            return Err(StoreError::DuplicateId { id: item.id });
        }

        for existing in self.items.iter_mut().filter(|existing| existing.rank >= rank) {
            existing.rank += 1;
        }
        self.items.push(item);
        self.resort();
        Ok(())
    }

    /// Remove the item at `rank`, closing the gap behind it
    pub(crate) fn remove_at(&mut self, rank: Rank) -> Result<RankedItem<T>, StoreError> {
        let max = self.items.len();
        if rank == 0 || rank > max {
            return Err(StoreError::RankOutOfRange { rank, max });
        }

        let removed = self.items.remove(rank - 1);
        for existing in self.items.iter_mut().filter(|existing| existing.rank > rank) {
            existing.rank -= 1;
        }
        self.resort();
        Ok(removed)
    }

    /// Move the item at `from` to `to`, shifting only the items between the two slots
    pub(crate) fn move_to(&mut self, from: Rank, to: Rank) -> Result<(), StoreError> {
        let max = self.items.len();
        for rank in [from, to] {
            if rank == 0 || rank > max {
                return Err(StoreError::RankOutOfRange { rank, max });
            }
        }
        if from == to {
            return Ok(());
        }

        let moved_id = self.items[from - 1].id.clone();
        for existing in self.items.iter_mut() {
            if existing.id == moved_id {
                existing.rank = to;
            } else if to > from && existing.rank > from && existing.rank <= to {
                existing.rank -= 1;
            } else if to < from && existing.rank >= to && existing.rank < from {
                existing.rank += 1;
            }
        }
        self.resort();
        Ok(())
    }

    /// Swap in new payload/metadata for an item while keeping its current rank
    pub(crate) fn replace(&mut self, mut item: RankedItem<T>) -> Result<(), StoreError> {
        let slot = self
            .items
            .iter_mut()
            .find(|existing| existing.id == item.id)
            .ok_or_else(|| StoreError::NotFound {
                id: item.id.clone(),
            })?;
        item.rank = slot.rank;
        *slot = item;
        Ok(())
    }

    fn resort(&mut self) {
        self.items.sort_by_key(|item| item.rank);
    }
}
