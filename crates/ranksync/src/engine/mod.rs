//! Reconciliation engine
//!
//! A synchronous state machine over one [`RankedCollectionStore`]. Every
//! input (remote batch, local request, persistence outcome, resync result)
//! is processed to completion and answered with a list of [`Effect`]s. The
//! async driver in [`crate::session`] feeds inputs one at a time from a
//! single queue, so no two mutations ever interleave.
//!
//! Resync handling: when an event cannot be applied (unknown id, rank out of
//! range) the rest of its batch is discarded and the loader is re-invoked.
//! Batches arriving while that fetch is in flight are buffered and replayed
//! in arrival order on top of the fresh snapshot. Local writes accepted
//! after the resync was triggered survive it: they are re-applied on top of
//! the replayed state.

pub mod apply;
pub mod coordinator;
mod effects;

use std::sync::Arc;

use ranksync_api::{
    ApiError, ChangeEvent, LocalMutationRequest, MutationOutcome, ParentId, PendingWrite,
    RankedItem, WriteAck,
};
use tracing::{debug, info, warn};

pub use apply::{Applied, ApplyError};
pub use coordinator::{Completion, OptimisticMutationCoordinator, RollbackPolicy, Submission};
pub use effects::{Effect, EngineEvent};

use crate::snapshot::CollectionSnapshot;
use crate::store::RankedCollectionStore;

#[derive(Debug)]
enum Phase<T> {
    Ready,
    Resyncing {
        generation: u64,
        buffered: Vec<ChangeEvent<T>>,
        /// Writes accepted after the trigger, in submission order
        local: Vec<(PendingWrite, LocalMutationRequest)>,
    },
}

#[derive(Debug)]
pub struct ReconciliationEngine<T> {
    store: RankedCollectionStore<T>,
    coordinator: OptimisticMutationCoordinator<T>,
    phase: Phase<T>,
    generation: u64,
    version: u64,
    can_edit: bool,
}

impl<T: Clone + PartialEq> ReconciliationEngine<T> {
    pub fn new(parent_id: impl Into<ParentId>, policy: RollbackPolicy) -> Self {
        Self {
            store: RankedCollectionStore::new(parent_id),
            coordinator: OptimisticMutationCoordinator::new(policy),
            phase: Phase::Ready,
            generation: 0,
            version: 0,
            can_edit: true,
        }
    }

    pub fn parent_id(&self) -> &str {
        self.store.parent_id()
    }

    pub fn store(&self) -> &RankedCollectionStore<T> {
        &self.store
    }

    pub fn coordinator(&self) -> &OptimisticMutationCoordinator<T> {
        &self.coordinator
    }

    pub fn is_resyncing(&self) -> bool {
        matches!(self.phase, Phase::Resyncing { .. })
    }

    pub fn can_edit(&self) -> bool {
        self.can_edit
    }

    pub fn set_can_edit(&mut self, can_edit: bool) {
        self.can_edit = can_edit;
    }

    /// Current state as a snapshot, without publishing
    pub fn snapshot(&self) -> Arc<CollectionSnapshot<T>> {
        Arc::new(CollectionSnapshot {
            parent_id: self.store.parent_id().to_string(),
            version: self.version,
            items: self.store.snapshot(),
        })
    }

    /// Seed the store from the initial loader
    pub fn load(&mut self, items: Vec<RankedItem<T>>) -> Result<Vec<Effect<T>>, ApiError> {
        self.store.load(items)?;
        self.coordinator.reset(&self.store);
        Ok(vec![self.publish()])
    }

    /// Apply a batch of remote events in order
    pub fn handle_remote(&mut self, batch: Vec<ChangeEvent<T>>) -> Vec<Effect<T>> {
        let parent_id = self.store.parent_id().to_string();
        let events: Vec<ChangeEvent<T>> = batch
            .into_iter()
            .filter(|event| {
                let ours = event.parent_id() == &parent_id;
                if !ours {
                    debug!(item_id = event.item_id(), parent_id = %event.parent_id(), "ignoring event for another collection");
                }
                ours
            })
            .collect();

        if let Phase::Resyncing { buffered, .. } = &mut self.phase {
            debug!(count = events.len(), "buffering events while resync is in flight");
            buffered.extend(events);
            return Vec::new();
        }

        let mut effects = Vec::new();
        let mut changed = false;
        let mut events = events.into_iter();
        while let Some(event) = events.next() {
            match self.apply_remote(&event) {
                Ok(Applied::Changed) => changed = true,
                Ok(Applied::Unchanged) => {}
                Err(err) => {
                    warn!(
                        kind = event.kind(),
                        item_id = event.item_id(),
                        error = %err,
                        discarded = events.len(),
                        "cannot apply remote event, requesting resync"
                    );
                    if changed {
                        effects.push(self.publish());
                    }
                    effects.extend(self.request_resync(Some(apply_error_to_api(err))));
                    return effects;
                }
            }
        }

        if changed {
            effects.push(self.publish());
        }
        effects
    }

    /// Validate and optimistically apply a local request.
    ///
    /// Errors are returned synchronously and leave the store untouched.
    pub fn request(
        &mut self,
        request: LocalMutationRequest,
    ) -> Result<(Submission, Vec<Effect<T>>), ApiError> {
        if !self.can_edit {
            return Err(ApiError::PermissionDenied {
                message: format!("collection {} is read-only", self.store.parent_id()),
            });
        }

        let submission = self.coordinator.begin(&mut self.store, request.clone())?;
        let effects = match &submission {
            Submission::NoOp => {
                debug!(item_id = request.item_id(), "local request is a no-op");
                Vec::new()
            }
            Submission::Pending(write) => {
                debug!(
                    kind = request.kind(),
                    item_id = %write.item_id,
                    write_id = write.write_id,
                    "applied optimistically"
                );
                if let Phase::Resyncing { local, .. } = &mut self.phase {
                    local.push((write.clone(), request.clone()));
                }
                vec![
                    self.publish(),
                    Effect::Persist {
                        write: write.clone(),
                        request,
                    },
                ]
            }
        };
        Ok((submission, effects))
    }

    /// Reconcile a finished persistence call
    pub fn handle_persist_result(
        &mut self,
        write: &PendingWrite,
        result: Result<WriteAck, ApiError>,
    ) -> Vec<Effect<T>> {
        let reported = result.clone().map(|_| MutationOutcome::Applied);
        // Finished either way; a resync no longer needs to carry it
        if let Phase::Resyncing { local, .. } = &mut self.phase {
            local.retain(|(pending, _)| pending.write_id != write.write_id);
        }

        match self.coordinator.complete(&mut self.store, write, result) {
            Completion::Confirmed { realigned } => {
                let mut effects = Vec::new();
                if realigned {
                    effects.push(self.publish());
                }
                effects.push(Effect::Settle {
                    write_id: write.write_id,
                    outcome: Ok(MutationOutcome::Applied),
                });
                effects
            }
            Completion::Stale => vec![Effect::Settle {
                write_id: write.write_id,
                outcome: reported,
            }],
            Completion::RolledBack { error } => {
                let mut effects = vec![self.publish()];
                if error.is_user_visible() {
                    effects.push(Effect::Event(EngineEvent::Notification(error.clone())));
                }
                effects.push(Effect::Settle {
                    write_id: write.write_id,
                    outcome: Err(error),
                });
                effects
            }
            Completion::Resync { error } => {
                let mut effects = vec![self.publish()];
                if error.is_user_visible() {
                    effects.push(Effect::Event(EngineEvent::Notification(error.clone())));
                }
                effects.push(Effect::Settle {
                    write_id: write.write_id,
                    outcome: Err(error.clone()),
                });
                effects.extend(self.request_resync(Some(error)));
                effects
            }
        }
    }

    /// Start a full resync unless one is already in flight
    pub fn request_resync(&mut self, reason: Option<ApiError>) -> Vec<Effect<T>> {
        if let Phase::Resyncing { generation, .. } = &self.phase {
            debug!(generation, ?reason, "resync already in flight");
            return Vec::new();
        }

        self.generation += 1;
        let generation = self.generation;
        info!(generation, ?reason, "requesting full resync");
        self.phase = Phase::Resyncing {
            generation,
            buffered: Vec::new(),
            local: Vec::new(),
        };
        vec![
            Effect::Event(EngineEvent::ResyncRequested { generation, reason }),
            Effect::Resync { generation },
        ]
    }

    /// Install the loader's response to a resync and replay buffered events
    pub fn handle_resync_result(
        &mut self,
        generation: u64,
        result: Result<Vec<RankedItem<T>>, ApiError>,
    ) -> Vec<Effect<T>> {
        let (buffered, local) = match std::mem::replace(&mut self.phase, Phase::Ready) {
            Phase::Resyncing {
                generation: expected,
                buffered,
                local,
            } if expected == generation => (buffered, local),
            other => {
                debug!(generation, "ignoring stale resync result");
                self.phase = other;
                return Vec::new();
            }
        };

        let mut effects = Vec::new();
        let loaded = result.and_then(|items| self.store.load(items).map_err(ApiError::from));
        let reloaded = loaded.is_ok();
        let failure = match loaded {
            Ok(()) => {
                self.coordinator.reset(&self.store);
                None
            }
            Err(error) => {
                warn!(generation, %error, "resync failed");
                Some(error)
            }
        };

        let replayed = self.replay(buffered);
        // Without a reload the optimistic state of these writes is still in place
        if reloaded {
            self.resume(local);
        }
        effects.push(self.publish());

        match failure {
            None => {
                info!(generation, replayed, size = self.store.len(), "resync completed");
                effects.push(Effect::Event(EngineEvent::ResyncCompleted {
                    generation,
                    replayed,
                }));
            }
            Some(error) => {
                effects.push(Effect::Event(EngineEvent::Notification(error.clone())));
                effects.push(Effect::Event(EngineEvent::ResyncFailed { generation, error }));
            }
        }
        effects
    }

    fn apply_remote(&mut self, event: &ChangeEvent<T>) -> Result<Applied, ApplyError> {
        self.coordinator.apply_remote(&mut self.store, event)
    }

    // Replayed events that no longer fit are presumed to be part of the
    // freshly loaded snapshot already.
    fn replay(&mut self, buffered: Vec<ChangeEvent<T>>) -> usize {
        let mut replayed = 0;
        for event in buffered {
            match self.apply_remote(&event) {
                Ok(_) => replayed += 1,
                Err(err) => {
                    debug!(kind = event.kind(), item_id = event.item_id(), error = %err, "skipping buffered event");
                }
            }
        }
        replayed
    }

    fn resume(&mut self, local: Vec<(PendingWrite, LocalMutationRequest)>) {
        for (write, request) in local {
            let write_id = write.write_id;
            if self.coordinator.resume(&mut self.store, write, request) {
                debug!(write_id, "re-applied local write on top of reloaded state");
            }
        }
    }

    fn publish(&mut self) -> Effect<T> {
        self.version += 1;
        Effect::Publish(self.snapshot())
    }
}

fn apply_error_to_api(err: ApplyError) -> ApiError {
    match err {
        ApplyError::MissingItem { id } => ApiError::MissingItem { id },
        other => ApiError::InvalidSnapshot {
            message: other.to_string(),
        },
    }
}
