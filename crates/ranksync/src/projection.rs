//! Sort projection over snapshots
//!
//! Pure functions: the canonical (rank) order is never altered, projections
//! only produce reordered copies for display.

use std::cmp::Ordering;

use ranksync_api::{RankedItem, SortDirection, SortFields, SortKey, SortSpec, SortValue};

/// Order `items` for display according to `spec`.
///
/// Items whose value for the key is missing always come after every item
/// that has one, in both directions. Equal values fall back to rank order.
pub fn project<T: Clone + SortFields>(items: &[RankedItem<T>], spec: SortSpec) -> Vec<RankedItem<T>> {
    let mut projected = items.to_vec();
    match spec.key {
        SortKey::Rank => {
            projected.sort_by_key(|item| item.rank);
            if spec.direction == SortDirection::Descending {
                projected.reverse();
            }
        }
        key => projected.sort_by(|a, b| {
            compare_values(sort_value(a, key), sort_value(b, key), spec.direction)
                .then(a.rank.cmp(&b.rank))
        }),
    }
    projected
}

fn sort_value<T: SortFields>(item: &RankedItem<T>, key: SortKey) -> Option<SortValue> {
    match key {
        SortKey::DateAdded => Some(SortValue::Number(item.created_at.timestamp_millis())),
        key => item.payload.sort_value(key),
    }
}

fn compare_values(a: Option<SortValue>, b: Option<SortValue>, direction: SortDirection) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => match direction {
            SortDirection::Ascending => a.cmp(&b),
            SortDirection::Descending => b.cmp(&a),
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
