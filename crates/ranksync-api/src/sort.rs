//! Sort keys and the payload traits projections rely on

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Field a projected view can be ordered by.
///
/// `Rank` is the canonical (custom) order and `DateAdded` uses the item's
/// `created_at`; every other key is read from the payload via [`SortFields`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Rank,
    Title,
    Artist,
    Album,
    ReleaseDate,
    Duration,
    DateAdded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// Sort key plus direction; the default is canonical rank order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec {
    pub key: SortKey,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn new(key: SortKey, direction: SortDirection) -> Self {
        Self { key, direction }
    }

    /// Whether this spec is the identity projection over canonical order
    pub fn is_canonical(&self) -> bool {
        self.key == SortKey::Rank && self.direction == SortDirection::Ascending
    }
}

/// Comparable value extracted from a payload for one sort key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SortValue {
    Text(String),
    Date(NaiveDate),
    Number(i64),
}

impl SortValue {
    /// Text values compare case-insensitively
    pub fn text(value: &str) -> Self {
        Self::Text(value.to_lowercase())
    }
}

/// Payloads that can be ordered by the payload-backed sort keys.
///
/// Returning `None` means the value is missing; projections place such
/// items after every item that has a value, whatever the direction.
pub trait SortFields {
    fn sort_value(&self, key: SortKey) -> Option<SortValue>;
}

/// Payloads that expose text for fuzzy search
pub trait SearchFields {
    fn search_fields(&self) -> Vec<&str>;
}

impl SortFields for String {
    fn sort_value(&self, key: SortKey) -> Option<SortValue> {
        match key {
            SortKey::Title => Some(SortValue::text(self)),
            _ => None,
        }
    }
}

impl SearchFields for String {
    fn search_fields(&self) -> Vec<&str> {
        vec![self.as_str()]
    }
}
