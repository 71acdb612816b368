//! Applying change events to a store under the rank-density invariant
//!
//! All three algorithms locate the item by id and use the rank the store
//! currently holds for it, not the `before` rank carried by the event. That
//! keeps remote events composable with optimistic local moves that the
//! sender had not seen yet.

use ranksync_api::{ChangeEvent, Rank, RankedItem};

use crate::store::{RankedCollectionStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error("item not found: {id}")]
    MissingItem { id: String },

    #[error("{kind} of item {id} targets rank {rank}, collection allows 1..={max}")]
    RankOutOfRange {
        kind: &'static str,
        id: String,
        rank: Rank,
        max: Rank,
    },
}

/// Whether applying an event changed the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
}

pub fn apply_event<T: Clone + PartialEq>(
    store: &mut RankedCollectionStore<T>,
    event: &ChangeEvent<T>,
) -> Result<Applied, ApplyError> {
    match event {
        ChangeEvent::Insert { item } => apply_insert(store, item),
        ChangeEvent::Update { after, .. } => apply_update(store, after),
        ChangeEvent::Delete { item } => apply_delete(store, &item.id),
    }
}

/// Insert `item` at its rank. A duplicate delivery of an item the store
/// already tracks is handled as an update to the incoming rank.
pub fn apply_insert<T: Clone + PartialEq>(
    store: &mut RankedCollectionStore<T>,
    item: &RankedItem<T>,
) -> Result<Applied, ApplyError> {
    if store.contains(&item.id) {
        tracing::debug!(item_id = %item.id, rank = item.rank, "duplicate insert treated as update");
        return apply_update(store, item);
    }

    let max = store.len() + 1;
    if item.rank == 0 || item.rank > max {
        return Err(ApplyError::RankOutOfRange {
            kind: "insert",
            id: item.id.clone(),
            rank: item.rank,
            max,
        });
    }

    store
        .insert_at(item.clone())
        .map_err(|e| unexpected("insert", &item.id, e))?;
    Ok(Applied::Changed)
}

/// Move the item to `after.rank` and take over its new state
pub fn apply_update<T: Clone + PartialEq>(
    store: &mut RankedCollectionStore<T>,
    after: &RankedItem<T>,
) -> Result<Applied, ApplyError> {
    let current = store
        .get(&after.id)
        .ok_or_else(|| ApplyError::MissingItem {
            id: after.id.clone(),
        })?;
    let current_rank = current.rank;
    let content_changed =
        current.payload != after.payload || current.created_at != after.created_at;

    let max = store.len();
    if after.rank == 0 || after.rank > max {
        return Err(ApplyError::RankOutOfRange {
            kind: "update",
            id: after.id.clone(),
            rank: after.rank,
            max,
        });
    }

    if content_changed {
        store
            .replace(after.clone())
            .map_err(|e| unexpected("update", &after.id, e))?;
    }
    if current_rank != after.rank {
        store
            .move_to(current_rank, after.rank)
            .map_err(|e| unexpected("update", &after.id, e))?;
    }

    if content_changed || current_rank != after.rank {
        Ok(Applied::Changed)
    } else {
        Ok(Applied::Unchanged)
    }
}

/// Remove the item, wherever the store currently ranks it
pub fn apply_delete<T: Clone>(
    store: &mut RankedCollectionStore<T>,
    item_id: &str,
) -> Result<Applied, ApplyError> {
    let rank = store
        .get(item_id)
        .map(|item| item.rank)
        .ok_or_else(|| ApplyError::MissingItem {
            id: item_id.to_string(),
        })?;

    store
        .remove_at(rank)
        .map_err(|e| unexpected("delete", item_id, e))?;
    Ok(Applied::Changed)
}

// Range checks happen before every store call, so a store error here means
// the store itself is inconsistent.
fn unexpected(kind: &'static str, id: &str, err: StoreError) -> ApplyError {
    tracing::error!(kind, item_id = %id, error = %err, "store rejected a pre-validated mutation");
    match err {
        StoreError::RankOutOfRange { rank, max } => ApplyError::RankOutOfRange {
            kind,
            id: id.to_string(),
            rank,
            max,
        },
        _ => ApplyError::MissingItem { id: id.to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn item(id: &str, rank: Rank) -> RankedItem<String> {
        RankedItem::new(id, "p", rank, format!("payload-{}", id))
    }

    fn store_of(ids: &[&str]) -> RankedCollectionStore<String> {
        let mut store = RankedCollectionStore::new("p");
        store
            .load(
                ids.iter()
                    .enumerate()
                    .map(|(i, id)| item(id, i + 1))
                    .collect(),
            )
            .unwrap();
        store
    }

    fn order(store: &RankedCollectionStore<String>) -> Vec<(String, Rank)> {
        store
            .iter()
            .map(|item| (item.id.clone(), item.rank))
            .collect()
    }

    fn ids(store: &RankedCollectionStore<String>) -> Vec<&str> {
        store.iter().map(|item| item.id.as_str()).collect()
    }

    #[test]
    fn test_update_moves_only_items_between_slots() {
        let mut store = store_of(&["a", "b", "c", "d", "e"]);
        let before = store.get("b").cloned().unwrap();
        let event = ChangeEvent::Update {
            before: before.clone(),
            after: before.with_rank(4),
        };

        assert_eq!(apply_event(&mut store, &event), Ok(Applied::Changed));
        assert_eq!(ids(&store), vec!["a", "c", "d", "b", "e"]);
        assert!(store.is_dense());
    }

    #[test]
    fn test_update_to_same_rank_is_unchanged() {
        let mut store = store_of(&["a", "b"]);
        let b = store.get("b").cloned().unwrap();
        let event = ChangeEvent::Update {
            before: b.clone(),
            after: b,
        };
        assert_eq!(apply_event(&mut store, &event), Ok(Applied::Unchanged));
    }

    #[test]
    fn test_update_replaces_payload_in_place() {
        let mut store = store_of(&["a", "b"]);
        let before = store.get("a").cloned().unwrap();
        let mut after = before.clone();
        after.payload = "renamed".to_string();

        let event = ChangeEvent::Update { before, after };
        assert_eq!(apply_event(&mut store, &event), Ok(Applied::Changed));
        assert_eq!(store.get("a").unwrap().payload, "renamed");
        assert_eq!(ids(&store), vec!["a", "b"]);
    }

    #[test]
    fn test_update_uses_current_rank_not_event_before() {
        // Locally "c" was already moved to the front; the remote event still
        // believes it sits at rank 3.
        let mut store = store_of(&["c", "a", "b"]);
        let stale_before = item("c", 3);
        let event = ChangeEvent::Update {
            before: stale_before,
            after: store.get("c").cloned().unwrap().with_rank(2),
        };
        apply_event(&mut store, &event).unwrap();
        assert_eq!(ids(&store), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_missing_item_on_update_and_delete() {
        let mut store = store_of(&["a"]);
        let ghost = item("b", 1);

        let update = ChangeEvent::Update {
            before: ghost.clone(),
            after: ghost.clone(),
        };
        assert_eq!(
            apply_event(&mut store, &update),
            Err(ApplyError::MissingItem {
                id: "b".to_string()
            })
        );
        assert_eq!(
            apply_event(&mut store, &ChangeEvent::Delete { item: ghost }),
            Err(ApplyError::MissingItem {
                id: "b".to_string()
            })
        );
        // No partial patch
        assert_eq!(ids(&store), vec!["a"]);
    }

    #[test]
    fn test_duplicate_insert_becomes_move() {
        let mut store = store_of(&["a", "b", "c"]);
        let dup = store.get("a").cloned().unwrap().with_rank(3);
        apply_event(&mut store, &ChangeEvent::Insert { item: dup }).unwrap();
        assert_eq!(ids(&store), vec!["b", "c", "a"]);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_out_of_range_ranks_are_rejected() {
        let mut store = store_of(&["a", "b"]);
        let err = apply_event(
            &mut store,
            &ChangeEvent::Insert {
                item: item("z", 4),
            },
        )
        .unwrap_err();
        assert!(matches!(err, ApplyError::RankOutOfRange { max: 3, .. }));

        let a = store.get("a").cloned().unwrap();
        let err = apply_event(
            &mut store,
            &ChangeEvent::Update {
                before: a.clone(),
                after: a.with_rank(0),
            },
        )
        .unwrap_err();
        assert!(matches!(err, ApplyError::RankOutOfRange { kind: "update", .. }));
        assert_eq!(ids(&store), vec!["a", "b"]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert { slot: usize },
        Update { index: usize, slot: usize },
        Delete { index: usize },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<usize>().prop_map(|slot| Op::Insert { slot }),
            (any::<usize>(), any::<usize>()).prop_map(|(index, slot)| Op::Update { index, slot }),
            any::<usize>().prop_map(|index| Op::Delete { index }),
        ]
    }

    /// Turn an abstract op into a concrete event valid for the current store
    fn concretize(
        store: &RankedCollectionStore<String>,
        op: &Op,
        next_id: &mut usize,
    ) -> Option<ChangeEvent<String>> {
        let len = store.len();
        match op {
            Op::Insert { slot } => {
                *next_id += 1;
                let id = format!("n{}", next_id);
                Some(ChangeEvent::Insert {
                    item: item(&id, slot % (len + 1) + 1),
                })
            }
            Op::Update { index, slot } if len > 0 => {
                let before = store.snapshot()[index % len].clone();
                let after = before.clone().with_rank(slot % len + 1);
                Some(ChangeEvent::Update { before, after })
            }
            Op::Delete { index } if len > 0 => Some(ChangeEvent::Delete {
                item: store.snapshot()[index % len].clone(),
            }),
            _ => None,
        }
    }

    proptest! {
        #[test]
        fn prop_ranks_stay_dense(initial in 0usize..8, ops in prop::collection::vec(op_strategy(), 0..40)) {
            let names: Vec<String> = (0..initial).map(|i| format!("i{}", i)).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut store = store_of(&refs);
            let mut next_id = 0;

            for op in &ops {
                if let Some(event) = concretize(&store, op, &mut next_id) {
                    prop_assert!(apply_event(&mut store, &event).is_ok());
                }
                prop_assert!(store.is_dense());
                let ranks: Vec<Rank> = store.iter().map(|item| item.rank).collect();
                let expected: Vec<Rank> = (1..=store.len()).collect();
                prop_assert_eq!(ranks, expected);
            }
        }

        #[test]
        fn prop_insert_and_update_are_idempotent(
            initial in 1usize..8,
            op in op_strategy(),
        ) {
            let names: Vec<String> = (0..initial).map(|i| format!("i{}", i)).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut store = store_of(&refs);
            let mut next_id = 0;

            if let Some(event) = concretize(&store, &op, &mut next_id) {
                prop_assume!(!matches!(event, ChangeEvent::Delete { .. }));
                apply_event(&mut store, &event).unwrap();
                let once = order(&store);
                apply_event(&mut store, &event).unwrap();
                prop_assert_eq!(order(&store), once);
            }
        }

        #[test]
        fn prop_insert_then_delete_round_trips(initial in 0usize..8, slot in any::<usize>()) {
            let names: Vec<String> = (0..initial).map(|i| format!("i{}", i)).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut store = store_of(&refs);
            let before = order(&store);

            let inserted = item("fresh", slot % (initial + 1) + 1);
            apply_event(&mut store, &ChangeEvent::Insert { item: inserted.clone() }).unwrap();
            apply_event(&mut store, &ChangeEvent::Delete { item: inserted }).unwrap();

            prop_assert_eq!(order(&store), before);
        }
    }
}
