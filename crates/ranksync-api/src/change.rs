//! Change events delivered by the realtime channel
//!
//! Every event carries the full item state needed to apply it without a
//! re-fetch. On the wire the variant is selected by a string `kind`
//! discriminator; unknown discriminators are rejected with
//! [`ApiError::UnknownEventKind`] instead of being silently dropped.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::item::{ParentId, RankedItem};
use crate::ApiError;

const KNOWN_KINDS: [&str; 3] = ["insert", "update", "delete"];

/// Change notification for one item of a ranked collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent<T> {
    /// Item was added at `item.rank`
    Insert { item: RankedItem<T> },
    /// Item moved from `before.rank` to `after.rank` and/or its payload changed
    Update {
        before: RankedItem<T>,
        after: RankedItem<T>,
    },
    /// Item at `item.rank` was removed
    Delete { item: RankedItem<T> },
}

impl<T> ChangeEvent<T> {
    /// Id of the item this event refers to
    pub fn item_id(&self) -> &str {
        match self {
            Self::Insert { item } | Self::Delete { item } => &item.id,
            Self::Update { after, .. } => &after.id,
        }
    }

    pub fn parent_id(&self) -> &ParentId {
        match self {
            Self::Insert { item } | Self::Delete { item } => &item.parent_id,
            Self::Update { after, .. } => &after.parent_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

impl<T: DeserializeOwned> ChangeEvent<T> {
    /// Decode a loosely-typed event record into a typed event
    pub fn from_json(raw: serde_json::Value) -> Result<Self, ApiError> {
        let kind = raw
            .get("kind")
            .and_then(|k| k.as_str())
            .ok_or_else(|| ApiError::Decode {
                message: "missing `kind` discriminator".to_string(),
            })?
            .to_string();

        if !KNOWN_KINDS.contains(&kind.as_str()) {
            tracing::debug!(%kind, "rejecting change event with unknown kind");
            return Err(ApiError::UnknownEventKind { kind });
        }

        serde_json::from_value(raw).map_err(|e| ApiError::Decode {
            message: format!("{} event: {}", kind, e),
        })
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ApiError> {
        let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| ApiError::Decode {
            message: e.to_string(),
        })?;
        Self::from_json(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item_json(id: &str, rank: usize) -> serde_json::Value {
        json!({
            "id": id,
            "parent_id": "playlist-1",
            "rank": rank,
            "payload": "song",
            "created_at": "2024-05-01T10:00:00Z"
        })
    }

    #[test]
    fn test_decode_update_event() {
        let raw = json!({
            "kind": "update",
            "before": item_json("a", 3),
            "after": item_json("a", 1),
        });

        let event: ChangeEvent<String> = ChangeEvent::from_json(raw).unwrap();
        assert_eq!(event.kind(), "update");
        assert_eq!(event.item_id(), "a");
        match event {
            ChangeEvent::Update { before, after } => {
                assert_eq!(before.rank, 3);
                assert_eq!(after.rank, 1);
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_is_distinct_error() {
        let raw = json!({ "kind": "upsert", "item": item_json("a", 1) });
        let err = ChangeEvent::<String>::from_json(raw).unwrap_err();
        assert_eq!(
            err,
            ApiError::UnknownEventKind {
                kind: "upsert".to_string()
            }
        );
    }

    #[test]
    fn test_missing_discriminator() {
        let err = ChangeEvent::<String>::from_json(json!({ "item": item_json("a", 1) }))
            .unwrap_err();
        assert!(matches!(err, ApiError::Decode { .. }));
    }

    #[test]
    fn test_known_kind_with_bad_body() {
        let err = ChangeEvent::<String>::from_json_str(r#"{"kind":"delete","item":{"id":"a"}}"#)
            .unwrap_err();
        match err {
            ApiError::Decode { message } => assert!(message.starts_with("delete event")),
            other => panic!("expected decode error, got {:?}", other),
        }
    }
}
