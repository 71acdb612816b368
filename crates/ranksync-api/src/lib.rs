use serde::{Deserialize, Serialize};

pub mod change;
pub mod item;
pub mod mutation;
pub mod sort;
pub mod streaming;
pub mod track;

pub use change::ChangeEvent;
pub use item::{ItemId, ParentId, Rank, RankedItem};
pub use mutation::{LocalMutationRequest, MutationOutcome, PendingWrite, WriteAck, WriteId};
pub use sort::{SearchFields, SortDirection, SortFields, SortKey, SortSpec, SortValue};
pub use streaming::{
    ChangeBatch, ChangeNotifications, ChangeStream, CollectionBackend, CollectionLoader,
    PersistenceBackend,
};
pub use track::Track;

/// Structured error types for collection sync operations.
///
/// Every failure the engine can observe or report maps onto one of these
/// variants. Errors are `Clone` so they can be fanned out to several
/// listeners (error notifications, pending mutation handles).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ApiError {
    /// Network failure while persisting, loading or resyncing
    #[error("Transient I/O error: {message}")]
    TransientIo { message: String },

    /// An Update/Delete referenced an item the store does not track
    #[error("Item not found: {id}")]
    MissingItem { id: String },

    /// A local request was malformed (e.g. target rank out of range)
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// The backend rejected a write because its expected state was stale
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// A raw change event carried a discriminator this engine does not know
    #[error("Unknown change event kind: {kind}")]
    UnknownEventKind { kind: String },

    /// A raw change event could not be decoded
    #[error("Malformed change event: {message}")]
    Decode { message: String },

    /// The loader returned items violating rank density or parent identity
    #[error("Invalid snapshot: {message}")]
    InvalidSnapshot { message: String },

    /// Local edits are not allowed for this collection
    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    /// The session has shut down
    #[error("Session closed")]
    Closed,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ApiError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientIo {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn missing(id: impl Into<String>) -> Self {
        Self::MissingItem { id: id.into() }
    }

    /// Whether this error should be shown to the user as a dismissable notification
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::MissingItem { .. } | Self::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
