use std::sync::Arc;

use ranksync_api::{ApiError, LocalMutationRequest, MutationOutcome, PendingWrite, WriteId};

use crate::snapshot::CollectionSnapshot;

/// Work the engine asks its driver to carry out after processing an input.
///
/// The engine itself never awaits anything; I/O effects are run by the
/// driver as separate tasks whose results come back as new inputs.
#[derive(Debug, Clone)]
pub enum Effect<T> {
    /// Hand a new snapshot to subscribers
    Publish(Arc<CollectionSnapshot<T>>),
    /// Issue a persistence call for an optimistically applied request
    Persist {
        write: PendingWrite,
        request: LocalMutationRequest,
    },
    /// Re-invoke the loader; the result must be fed back with `generation`
    Resync { generation: u64 },
    /// Resolve the caller's handle for a write
    Settle {
        write_id: WriteId,
        outcome: Result<MutationOutcome, ApiError>,
    },
    Event(EngineEvent),
}

/// Observable engine occurrences, broadcast to session listeners
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A failure the user should be told about (dismissable notification)
    Notification(ApiError),
    /// `reason` is `None` for resyncs requested by the caller
    ResyncRequested {
        generation: u64,
        reason: Option<ApiError>,
    },
    ResyncCompleted { generation: u64, replayed: usize },
    ResyncFailed { generation: u64, error: ApiError },
}
