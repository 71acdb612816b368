//! Optimistic local mutations and their rollback
//!
//! A local move/delete is applied to the store right away, then persisted.
//! While any local write is outstanding the coordinator also keeps a
//! confirmed copy of the collection that only the change stream updates,
//! in stream order. Writes the backend acknowledged but whose echo has not
//! arrived yet are kept aside: they committed after everything the stream
//! has delivered so far, so replaying them on top of the confirmed copy
//! gives the backend's state. Once nothing is outstanding the store is
//! realigned to the confirmed copy.
//!
//! A failed write is rolled back according to the [`RollbackPolicy`]:
//!
//! - `SharedCheckpoint`: the store is restored to the confirmed copy plus
//!   the acknowledged writes, dropping every other in-flight optimistic
//!   change as well.
//! - `PerItem`: only the failed write is undone.

use std::collections::VecDeque;

use chrono::Utc;
use ranksync_api::{
    ApiError, ChangeEvent, ItemId, LocalMutationRequest, PendingWrite, Rank, RankedItem, WriteAck,
    WriteId,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::apply::{self, Applied, ApplyError};
use crate::store::RankedCollectionStore;

/// Local deletes remembered so late events for the item are recognised
const TOMBSTONE_LIMIT: usize = 256;

/// Acknowledged writes held while their echo is outstanding
const UNECHOED_LIMIT: usize = 256;

/// How a failed write is rolled back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackPolicy {
    #[default]
    SharedCheckpoint,
    PerItem,
}

/// Result of accepting a local request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Nothing to change; no write is issued
    NoOp,
    /// Applied optimistically; the write still has to be persisted
    Pending(PendingWrite),
}

/// What the engine should do once a write has finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Backend acknowledged. `realigned` is set when this was the last
    /// outstanding write and the store was replaced by the confirmed state.
    Confirmed { realigned: bool },
    /// The write was superseded or dropped by an earlier rollback
    Stale,
    /// The store was rolled back; `error` should be reported
    RolledBack { error: ApiError },
    /// Rollback was impossible or the failure calls for it; resync required
    Resync { error: ApiError },
}

#[derive(Debug, Clone)]
enum Undo<T> {
    MoveBack { item_id: ItemId, rank: Rank },
    Reinsert { item: RankedItem<T> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    /// Neither the outcome nor the echo has arrived
    InFlight,
    /// Echo seen, outcome outstanding
    Echoed,
    /// Backend accepted the write, echo outstanding
    Acknowledged,
}

#[derive(Debug, Clone)]
struct Entry<T> {
    write: PendingWrite,
    request: LocalMutationRequest,
    undo: Undo<T>,
    progress: Progress,
}

impl<T> Entry<T> {
    fn is_pending(&self) -> bool {
        self.progress != Progress::Acknowledged
    }
}

#[derive(Debug)]
pub struct OptimisticMutationCoordinator<T> {
    policy: RollbackPolicy,
    next_write_id: WriteId,
    /// Outstanding local writes in submission order
    entries: Vec<Entry<T>>,
    /// Stream-only state, held while `entries` is non-empty
    confirmed: Option<RankedCollectionStore<T>>,
    tombstones: VecDeque<ItemId>,
}

impl<T: Clone + PartialEq> OptimisticMutationCoordinator<T> {
    pub fn new(policy: RollbackPolicy) -> Self {
        Self {
            policy,
            next_write_id: 1,
            entries: Vec::new(),
            confirmed: None,
            tombstones: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> RollbackPolicy {
        self.policy
    }

    /// Writes still waiting for their outcome
    pub fn pending_writes(&self) -> impl Iterator<Item = &PendingWrite> {
        self.entries
            .iter()
            .filter(|entry| entry.is_pending())
            .map(|entry| &entry.write)
    }

    pub fn has_pending(&self, item_id: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.is_pending() && entry.write.item_id == item_id)
    }

    /// Acknowledged writes whose confirming event has not arrived
    pub fn unechoed_writes(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.progress == Progress::Acknowledged)
            .count()
    }

    /// Whether a failure can be rolled back without a resync
    pub fn has_confirmed_state(&self) -> bool {
        self.confirmed.is_some()
    }

    pub fn is_tombstoned(&self, item_id: &str) -> bool {
        self.tombstones.iter().any(|id| id == item_id)
    }

    /// Validate `request` and apply it optimistically to `store`.
    ///
    /// Validation failures leave the store untouched.
    pub fn begin(
        &mut self,
        store: &mut RankedCollectionStore<T>,
        request: LocalMutationRequest,
    ) -> Result<Submission, ApiError> {
        let current = store
            .get(request.item_id())
            .cloned()
            .ok_or_else(|| {
                ApiError::validation(format!(
                    "item {} is not part of collection {}",
                    request.item_id(),
                    store.parent_id()
                ))
            })?;

        if let LocalMutationRequest::Move { target_rank, .. } = &request {
            let max = store.len();
            if *target_rank == 0 || *target_rank > max {
                return Err(ApiError::validation(format!(
                    "target rank {} outside 1..={}",
                    target_rank, max
                )));
            }
            if *target_rank == current.rank {
                return Ok(Submission::NoOp);
            }
        }

        let write = PendingWrite {
            write_id: self.next_write_id,
            item_id: current.id.clone(),
            submitted_at: Utc::now(),
        };
        self.next_write_id += 1;

        self.track(store, current, write.clone(), request)?;
        Ok(Submission::Pending(write))
    }

    /// Re-apply a write whose optimistic state was replaced by a fresh load.
    ///
    /// The write keeps its id so its outcome is still matched. A move target
    /// past the end of the reloaded collection is clamped; a write for an
    /// item the load no longer holds is dropped and `false` returned.
    pub fn resume(
        &mut self,
        store: &mut RankedCollectionStore<T>,
        write: PendingWrite,
        request: LocalMutationRequest,
    ) -> bool {
        let Some(current) = store.get(request.item_id()).cloned() else {
            debug!(write_id = write.write_id, item_id = %write.item_id, "item gone after reload, not resuming write");
            return false;
        };
        let applied = match &request {
            LocalMutationRequest::Move { target_rank, .. } => {
                let target = (*target_rank).clamp(1, store.len());
                store.move_to(current.rank, target).map(|_| Undo::MoveBack {
                    item_id: current.id.clone(),
                    rank: current.rank,
                })
            }
            LocalMutationRequest::Delete { .. } => store.remove_at(current.rank).map(|_| {
                Undo::Reinsert {
                    item: current.clone(),
                }
            }),
        };
        match applied {
            Ok(undo) => {
                // The store was just loaded, so before this write it matched the stream
                let mut confirmed = store.clone();
                replay_undo(&mut confirmed, &undo);
                if self.entries.is_empty() {
                    self.confirmed = Some(confirmed);
                }
                self.push(write, request, undo);
                true
            }
            Err(err) => {
                warn!(error = %err, "could not resume write after reload");
                false
            }
        }
    }

    /// Reconcile the outcome of a persistence call
    pub fn complete(
        &mut self,
        store: &mut RankedCollectionStore<T>,
        write: &PendingWrite,
        result: Result<WriteAck, ApiError>,
    ) -> Completion {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.is_pending() && entry.write.write_id == write.write_id);
        let Some(position) = position else {
            debug!(write_id = write.write_id, item_id = %write.item_id, "ignoring outcome of stale write");
            return Completion::Stale;
        };

        match result {
            Ok(WriteAck) => {
                if self.entries[position].progress == Progress::Echoed {
                    self.entries.remove(position);
                } else {
                    self.entries[position].progress = Progress::Acknowledged;
                    self.limit_unechoed();
                }
                Completion::Confirmed {
                    realigned: self.realign(store),
                }
            }
            Err(error) => {
                warn!(write_id = write.write_id, item_id = %write.item_id, %error, "write failed, rolling back");
                let entry = self.entries.remove(position);
                if matches!(entry.request, LocalMutationRequest::Delete { .. }) {
                    self.tombstones.retain(|id| *id != entry.write.item_id);
                }
                let rolled_back = match self.policy {
                    RollbackPolicy::SharedCheckpoint => self.restore_confirmed(store),
                    RollbackPolicy::PerItem => self.undo(store, entry.undo),
                };

                if !rolled_back {
                    self.reset(store);
                    return Completion::Resync { error };
                }
                self.realign(store);
                if matches!(error, ApiError::Conflict { .. }) {
                    Completion::Resync { error }
                } else {
                    Completion::RolledBack { error }
                }
            }
        }
    }

    /// Apply a remote event to `store` and to the confirmed state.
    ///
    /// Events for an item deleted locally do not reach the store: the
    /// confirming Delete, or a late Update/Insert for the deleted item.
    pub fn apply_remote(
        &mut self,
        store: &mut RankedCollectionStore<T>,
        event: &ChangeEvent<T>,
    ) -> Result<Applied, ApplyError> {
        self.mirror(event);

        let id = event.item_id();
        let applied = if !store.contains(id) && self.is_tombstoned(id) {
            debug!(kind = event.kind(), item_id = id, "event targets a locally deleted item");
            Applied::Unchanged
        } else {
            apply::apply_event(store, event)?
        };

        if self.realign(store) {
            Ok(Applied::Changed)
        } else {
            Ok(applied)
        }
    }

    /// Forget optimistic bookkeeping superseded by a fresh load of `store`.
    ///
    /// Tombstones for items the load no longer holds are kept so their late
    /// confirming Delete is still recognised.
    pub fn reset(&mut self, store: &RankedCollectionStore<T>) {
        self.entries.clear();
        self.confirmed = None;
        self.tombstones.retain(|id| !store.contains(id));
    }

    fn track(
        &mut self,
        store: &mut RankedCollectionStore<T>,
        current: RankedItem<T>,
        write: PendingWrite,
        request: LocalMutationRequest,
    ) -> Result<(), ApiError> {
        if self.entries.is_empty() {
            self.confirmed = Some(store.clone());
        }

        let undo = match &request {
            LocalMutationRequest::Move { target_rank, .. } => {
                store.move_to(current.rank, *target_rank)?;
                Undo::MoveBack {
                    item_id: current.id.clone(),
                    rank: current.rank,
                }
            }
            LocalMutationRequest::Delete { .. } => {
                store.remove_at(current.rank)?;
                Undo::Reinsert { item: current }
            }
        };
        self.push(write, request, undo);
        Ok(())
    }

    fn push(&mut self, write: PendingWrite, request: LocalMutationRequest, undo: Undo<T>) {
        let write_id = write.write_id;
        let item_id = write.item_id.clone();
        self.entries.retain(|entry| {
            let superseded = entry.is_pending() && entry.write.item_id == item_id;
            if superseded {
                debug!(
                    %item_id,
                    superseded = entry.write.write_id,
                    write_id,
                    "superseding pending write"
                );
            }
            !superseded
        });
        if matches!(request, LocalMutationRequest::Delete { .. }) {
            self.add_tombstone(item_id);
        }
        self.entries.push(Entry {
            write,
            request,
            undo,
            progress: Progress::InFlight,
        });
    }

    /// Mirror `event` onto the confirmed state and match it against local writes
    fn mirror(&mut self, event: &ChangeEvent<T>) {
        if let Some(confirmed) = self.confirmed.as_mut() {
            match apply::apply_event(confirmed, event) {
                Ok(_) => {}
                Err(ApplyError::MissingItem { .. })
                    if matches!(event, ChangeEvent::Delete { .. }) => {}
                Err(err) => {
                    warn!(error = %err, "confirmed state diverged from the change stream, dropping it");
                    self.confirmed = None;
                }
            }
        }

        let echo = self.entries.iter().position(|entry| {
            entry.progress != Progress::Echoed && confirms(&entry.request, event)
        });
        if let Some(position) = echo {
            let entry = &mut self.entries[position];
            debug!(write_id = entry.write.write_id, item_id = %entry.write.item_id, "confirming event for local write");
            if entry.progress == Progress::Acknowledged {
                self.entries.remove(position);
            } else {
                entry.progress = Progress::Echoed;
            }
        }
    }

    /// Adopt the confirmed state once no local write is outstanding
    fn realign(&mut self, store: &mut RankedCollectionStore<T>) -> bool {
        if !self.entries.is_empty() {
            return false;
        }
        let Some(confirmed) = self.confirmed.take() else {
            return false;
        };
        if confirmed.iter().eq(store.iter()) {
            return false;
        }
        debug!(size = confirmed.len(), "realigning store with confirmed state");
        *store = confirmed;
        true
    }

    fn restore_confirmed(&mut self, store: &mut RankedCollectionStore<T>) -> bool {
        let Some(mut restored) = self.confirmed.clone() else {
            return false;
        };
        let before = self.entries.len();
        self.entries
            .retain(|entry| entry.progress == Progress::Acknowledged);
        if self.entries.len() < before {
            debug!(
                dropped = before - self.entries.len(),
                "rollback discards other in-flight optimistic writes"
            );
        }
        for entry in &self.entries {
            replay(&mut restored, &entry.request);
        }
        *store = restored;
        true
    }

    fn limit_unechoed(&mut self) {
        if self.unechoed_writes() <= UNECHOED_LIMIT {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .position(|entry| entry.progress == Progress::Acknowledged);
        if let Some(position) = oldest {
            let entry = self.entries.remove(position);
            warn!(write_id = entry.write.write_id, "no confirming event for acknowledged write, folding it into confirmed state");
            if let Some(confirmed) = self.confirmed.as_mut() {
                replay(confirmed, &entry.request);
            }
        }
    }

    fn add_tombstone(&mut self, item_id: ItemId) {
        if self.is_tombstoned(&item_id) {
            return;
        }
        if self.tombstones.len() == TOMBSTONE_LIMIT {
            self.tombstones.pop_front();
        }
        self.tombstones.push_back(item_id);
    }

    fn undo(&mut self, store: &mut RankedCollectionStore<T>, undo: Undo<T>) -> bool {
        match undo {
            Undo::MoveBack { item_id, rank } => {
                let Some(current) = store.get(&item_id).map(|item| item.rank) else {
                    // Removed remotely in the meantime; nothing left to undo
                    return true;
                };
                let target = rank.min(store.len());
                store.move_to(current, target).is_ok()
            }
            Undo::Reinsert { item } => {
                if store.contains(&item.id) {
                    return true;
                }
                let rank = item.rank.min(store.len() + 1);
                store.insert_at(item.with_rank(rank)).is_ok()
            }
        }
    }
}

/// Whether `event` is what the backend emits after applying `request`
fn confirms<T>(request: &LocalMutationRequest, event: &ChangeEvent<T>) -> bool {
    if request.item_id() != event.item_id() {
        return false;
    }
    match (request, event) {
        (LocalMutationRequest::Move { target_rank, .. }, ChangeEvent::Update { after, .. }) => {
            after.rank == *target_rank
        }
        (LocalMutationRequest::Delete { .. }, ChangeEvent::Delete { .. }) => true,
        _ => false,
    }
}

/// Apply an acknowledged write to a state that does not contain it yet
fn replay<T: Clone + PartialEq>(store: &mut RankedCollectionStore<T>, request: &LocalMutationRequest) {
    let Some(current) = store.get(request.item_id()).map(|item| item.rank) else {
        return;
    };
    let result = match request {
        LocalMutationRequest::Move { target_rank, .. } => {
            store.move_to(current, (*target_rank).min(store.len()))
        }
        LocalMutationRequest::Delete { .. } => store.remove_at(current).map(|_| ()),
    };
    if let Err(err) = result {
        debug!(item_id = request.item_id(), error = %err, "acknowledged write no longer applies");
    }
}

/// Take a just-applied local write back out of `store`
fn replay_undo<T: Clone + PartialEq>(store: &mut RankedCollectionStore<T>, undo: &Undo<T>) {
    let result = match undo {
        Undo::MoveBack { item_id, rank } => match store.get(item_id).map(|item| item.rank) {
            Some(current) => store.move_to(current, *rank),
            None => Ok(()),
        },
        Undo::Reinsert { item } => store.insert_at(item.clone()),
    };
    if let Err(err) = result {
        debug!(error = %err, "could not reconstruct state before resumed write");
    }
}
