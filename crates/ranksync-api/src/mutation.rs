//! Local mutation requests and write bookkeeping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::item::{ItemId, Rank};

/// Monotonic id assigned to every persistence call the engine issues
pub type WriteId = u64;

/// A user-initiated change awaiting persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocalMutationRequest {
    Move { item_id: ItemId, target_rank: Rank },
    Delete { item_id: ItemId },
}

impl LocalMutationRequest {
    /// Build a move from a 0-based UI drop index
    pub fn move_to_index(item_id: impl Into<ItemId>, target_index: usize) -> Self {
        Self::Move {
            item_id: item_id.into(),
            target_rank: target_index + 1,
        }
    }

    pub fn delete(item_id: impl Into<ItemId>) -> Self {
        Self::Delete {
            item_id: item_id.into(),
        }
    }

    pub fn item_id(&self) -> &str {
        match self {
            Self::Move { item_id, .. } | Self::Delete { item_id } => item_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Move { .. } => "move",
            Self::Delete { .. } => "delete",
        }
    }
}

/// An outstanding persistence call for one item.
///
/// At most one pending write is tracked per item; a newer write for the
/// same item replaces this record without cancelling the call in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub write_id: WriteId,
    pub item_id: ItemId,
    pub submitted_at: DateTime<Utc>,
}

/// Backend acknowledgement of a successful write
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck;

/// Result of a local mutation once it has been fully reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationOutcome {
    /// Optimistically applied and acknowledged by the backend
    Applied,
    /// Nothing to do (e.g. move to the current rank); no write was issued
    NoOp,
}
