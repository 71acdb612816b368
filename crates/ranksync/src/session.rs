//! Async driver around the reconciliation engine
//!
//! One tokio task owns the engine and the view projector. Remote batches,
//! local requests, persistence outcomes and resync responses all reach it
//! through a single unbounded queue and are processed strictly one at a
//! time. Backend calls run in their own tasks and report back through the
//! same queue, so a slow write never stalls event processing.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use ranksync_api::{
    ApiError, ChangeBatch, ChangeStream, CollectionBackend, LocalMutationRequest,
    MutationOutcome, ParentId, PendingWrite, RankedItem, SearchFields, SortDirection,
    SortFields, SortKey, SortSpec, WriteAck, WriteId,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::EngineConfig;
use crate::engine::{Effect, EngineEvent, ReconciliationEngine, Submission};
use crate::snapshot::CollectionSnapshot;
use crate::view::{ProjectedView, ViewProjector};

/// Payloads a session can manage
pub trait CollectionPayload:
    Clone + PartialEq + Send + Sync + SortFields + SearchFields + 'static
{
}

impl<T> CollectionPayload for T where
    T: Clone + PartialEq + Send + Sync + SortFields + SearchFields + 'static
{
}

type OutcomeSender = oneshot::Sender<Result<MutationOutcome, ApiError>>;

enum Input<T> {
    Remote(ChangeBatch<T>),
    StreamError(ApiError),
    StreamClosed,
    Request {
        request: LocalMutationRequest,
        reply: oneshot::Sender<Result<PendingMutation, ApiError>>,
    },
    PersistDone {
        write: PendingWrite,
        result: Result<WriteAck, ApiError>,
    },
    ResyncDone {
        generation: u64,
        result: Result<Vec<RankedItem<T>>, ApiError>,
    },
    SetSort(SortSpec),
    SetQuery(String),
    SetCanEdit(bool),
    Resync,
    Shutdown,
}

/// Handle for an accepted local request
#[derive(Debug)]
pub struct PendingMutation {
    write_id: Option<WriteId>,
    outcome: oneshot::Receiver<Result<MutationOutcome, ApiError>>,
}

impl PendingMutation {
    /// `None` when the request was a no-op and nothing was written
    pub fn write_id(&self) -> Option<WriteId> {
        self.write_id
    }

    /// Wait until the backend has accepted or refused the write.
    ///
    /// A refused write has already been rolled back when this returns.
    pub async fn outcome(self) -> Result<MutationOutcome, ApiError> {
        self.outcome.await.unwrap_or_else(|_| Err(ApiError::Closed))
    }
}

/// Callback subscription; dropping it unsubscribes
#[derive(Debug)]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A live, reconciled view of one ranked collection
pub struct CollectionSession<T> {
    parent_id: ParentId,
    inputs: mpsc::UnboundedSender<Input<T>>,
    snapshots: watch::Receiver<Arc<CollectionSnapshot<T>>>,
    views: watch::Receiver<Arc<ProjectedView<T>>>,
    errors: broadcast::Sender<ApiError>,
    events: broadcast::Sender<EngineEvent>,
    task: Option<JoinHandle<()>>,
}

impl<T: CollectionPayload> CollectionSession<T> {
    /// Load the collection, subscribe to its changes and start the engine.
    ///
    /// The change stream is opened before the initial load so no event
    /// published in between is lost.
    #[tracing::instrument(skip(backend, config))]
    pub async fn open<B>(
        parent_id: &str,
        backend: Arc<B>,
        config: EngineConfig,
    ) -> Result<Self, ApiError>
    where
        B: CollectionBackend<T> + ?Sized + 'static,
    {
        let stream = backend.watch_changes(parent_id).await;
        let items = backend.load_collection(parent_id).await?;

        let mut engine = ReconciliationEngine::new(parent_id, config.rollback);
        engine.load(items)?;
        let snapshot = engine.snapshot();
        info!(size = snapshot.len(), "collection loaded");

        let projector = ViewProjector::new(config.search.clone(), Arc::clone(&snapshot));
        let (snapshots_tx, snapshots) = watch::channel(snapshot);
        let (views_tx, views) = watch::channel(projector.render());
        let (errors, _) = broadcast::channel(config.error_channel_capacity);
        let (events, _) = broadcast::channel(config.error_channel_capacity);
        let (inputs, inputs_rx) = mpsc::unbounded_channel();

        let forwarder = tokio::spawn(
            forward_changes(stream, inputs.clone())
                .instrument(info_span!("change_feed", parent_id)),
        );

        let task = EngineTask {
            engine,
            projector,
            backend,
            inputs: inputs.clone(),
            snapshots: snapshots_tx,
            views: views_tx,
            errors: errors.clone(),
            events: events.clone(),
            waiters: HashMap::new(),
            forwarder,
        };
        let task = tokio::spawn(task.run(inputs_rx).instrument(info_span!("engine", parent_id)));

        Ok(Self {
            parent_id: parent_id.to_string(),
            inputs,
            snapshots,
            views,
            errors,
            events,
            task: Some(task),
        })
    }

    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<CollectionSnapshot<T>> {
        Arc::clone(&self.snapshots.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<CollectionSnapshot<T>>> {
        self.snapshots.clone()
    }

    /// Call `on_snapshot` with the current items and again after every change
    pub fn subscribe_fn<F>(&self, mut on_snapshot: F) -> Subscription
    where
        F: FnMut(&[RankedItem<T>]) + Send + 'static,
    {
        let mut snapshots = self.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                let snapshot = Arc::clone(&snapshots.borrow_and_update());
                on_snapshot(&snapshot.items);
                if snapshots.changed().await.is_err() {
                    break;
                }
            }
        });
        Subscription { handle }
    }

    pub fn view(&self) -> watch::Receiver<Arc<ProjectedView<T>>> {
        self.views.clone()
    }

    pub fn current_view(&self) -> Arc<ProjectedView<T>> {
        Arc::clone(&self.views.borrow())
    }

    /// User-facing failure notifications
    pub fn errors(&self) -> broadcast::Receiver<ApiError> {
        self.errors.subscribe()
    }

    /// Every engine event, including resync progress
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Move an item to a 0-based display index
    #[tracing::instrument(skip(self), fields(parent_id = %self.parent_id))]
    pub async fn request_move(
        &self,
        item_id: &str,
        target_index: usize,
    ) -> Result<PendingMutation, ApiError> {
        self.request(LocalMutationRequest::move_to_index(item_id, target_index))
            .await
    }

    #[tracing::instrument(skip(self), fields(parent_id = %self.parent_id))]
    pub async fn request_delete(&self, item_id: &str) -> Result<PendingMutation, ApiError> {
        self.request(LocalMutationRequest::delete(item_id)).await
    }

    pub fn set_sort(&self, key: SortKey, direction: SortDirection) -> Result<(), ApiError> {
        self.send(Input::SetSort(SortSpec::new(key, direction)))
    }

    pub fn set_search_query(&self, text: impl Into<String>) -> Result<(), ApiError> {
        self.send(Input::SetQuery(text.into()))
    }

    pub fn set_can_edit(&self, can_edit: bool) -> Result<(), ApiError> {
        self.send(Input::SetCanEdit(can_edit))
    }

    /// Discard local state and reload the collection
    pub fn resync(&self) -> Result<(), ApiError> {
        self.send(Input::Resync)
    }

    /// Stop the engine and wait for it to finish.
    ///
    /// Outstanding mutation handles resolve with [`ApiError::Closed`].
    pub async fn close(mut self) {
        let _ = self.inputs.send(Input::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "engine task ended abnormally");
            }
        }
    }

    async fn request(&self, request: LocalMutationRequest) -> Result<PendingMutation, ApiError> {
        let (reply, response) = oneshot::channel();
        self.send(Input::Request { request, reply })?;
        response.await.unwrap_or_else(|_| Err(ApiError::Closed))
    }

    fn send(&self, input: Input<T>) -> Result<(), ApiError> {
        self.inputs.send(input).map_err(|_| ApiError::Closed)
    }
}

impl<T> Drop for CollectionSession<T> {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.inputs.send(Input::Shutdown);
        }
    }
}

async fn forward_changes<T>(mut stream: ChangeStream<T>, inputs: mpsc::UnboundedSender<Input<T>>) {
    while let Some(received) = stream.next().await {
        let input = match received {
            Ok(batch) => Input::Remote(batch),
            Err(error) => Input::StreamError(error),
        };
        if inputs.send(input).is_err() {
            return;
        }
    }
    let _ = inputs.send(Input::StreamClosed);
}

struct EngineTask<T, B: ?Sized> {
    engine: ReconciliationEngine<T>,
    projector: ViewProjector<T>,
    backend: Arc<B>,
    inputs: mpsc::UnboundedSender<Input<T>>,
    snapshots: watch::Sender<Arc<CollectionSnapshot<T>>>,
    views: watch::Sender<Arc<ProjectedView<T>>>,
    errors: broadcast::Sender<ApiError>,
    events: broadcast::Sender<EngineEvent>,
    waiters: HashMap<WriteId, OutcomeSender>,
    forwarder: JoinHandle<()>,
}

impl<T, B> EngineTask<T, B>
where
    T: CollectionPayload,
    B: CollectionBackend<T> + ?Sized + 'static,
{
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input<T>>) {
        while let Some(input) = inputs.recv().await {
            if self.handle(input).is_break() {
                break;
            }
        }

        self.forwarder.abort();
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(ApiError::Closed));
        }
        info!("session closed");
    }

    fn handle(&mut self, input: Input<T>) -> ControlFlow<()> {
        let effects = match input {
            Input::Remote(batch) => self.engine.handle_remote(batch),
            Input::StreamError(error) => {
                warn!(%error, "change stream reported an error");
                self.engine.request_resync(Some(error))
            }
            Input::StreamClosed => {
                warn!("change stream ended, remote changes will no longer arrive");
                Vec::new()
            }
            Input::Request { request, reply } => match self.engine.request(request) {
                Ok((submission, effects)) => {
                    let (outcome_tx, outcome) = oneshot::channel();
                    let write_id = match submission {
                        Submission::NoOp => {
                            let _ = outcome_tx.send(Ok(MutationOutcome::NoOp));
                            None
                        }
                        Submission::Pending(write) => {
                            self.waiters.insert(write.write_id, outcome_tx);
                            Some(write.write_id)
                        }
                    };
                    let _ = reply.send(Ok(PendingMutation { write_id, outcome }));
                    effects
                }
                Err(error) => {
                    debug!(%error, "local request rejected");
                    let _ = reply.send(Err(error));
                    Vec::new()
                }
            },
            Input::PersistDone { write, result } => {
                self.engine.handle_persist_result(&write, result)
            }
            Input::ResyncDone { generation, result } => {
                self.engine.handle_resync_result(generation, result)
            }
            Input::SetSort(sort) => {
                self.projector.set_sort(sort);
                self.publish_view();
                Vec::new()
            }
            Input::SetQuery(query) => {
                self.projector.set_query(query);
                self.publish_view();
                Vec::new()
            }
            Input::SetCanEdit(can_edit) => {
                self.engine.set_can_edit(can_edit);
                Vec::new()
            }
            Input::Resync => self.engine.request_resync(None),
            Input::Shutdown => return ControlFlow::Break(()),
        };

        self.execute(effects);
        ControlFlow::Continue(())
    }

    fn execute(&mut self, effects: Vec<Effect<T>>) {
        for effect in effects {
            match effect {
                Effect::Publish(snapshot) => {
                    self.projector.on_snapshot(Arc::clone(&snapshot));
                    self.snapshots.send_replace(snapshot);
                    self.publish_view();
                }
                Effect::Persist { write, request } => self.spawn_persist(write, request),
                Effect::Resync { generation } => self.spawn_resync(generation),
                Effect::Settle { write_id, outcome } => {
                    if let Some(waiter) = self.waiters.remove(&write_id) {
                        let _ = waiter.send(outcome);
                    }
                }
                Effect::Event(event) => {
                    if let EngineEvent::Notification(error) = &event {
                        let _ = self.errors.send(error.clone());
                    }
                    let _ = self.events.send(event);
                }
            }
        }
    }

    fn publish_view(&self) {
        self.views.send_replace(self.projector.render());
    }

    fn spawn_persist(&self, write: PendingWrite, request: LocalMutationRequest) {
        let backend = Arc::clone(&self.backend);
        let inputs = self.inputs.clone();
        let span = info_span!("persist", write_id = write.write_id, item_id = %write.item_id);
        tokio::spawn(
            async move {
                let result = match &request {
                    LocalMutationRequest::Move {
                        item_id,
                        target_rank,
                    } => backend.move_item(item_id, *target_rank).await,
                    LocalMutationRequest::Delete { item_id } => backend.delete_item(item_id).await,
                };
                if let Err(error) = &result {
                    debug!(%error, "persistence call failed");
                }
                let _ = inputs.send(Input::PersistDone { write, result });
            }
            .instrument(span),
        );
    }

    fn spawn_resync(&self, generation: u64) {
        let backend = Arc::clone(&self.backend);
        let inputs = self.inputs.clone();
        let parent_id = self.engine.parent_id().to_string();
        tokio::spawn(
            async move {
                let result = backend.load_collection(&parent_id).await;
                let _ = inputs.send(Input::ResyncDone { generation, result });
            }
            .instrument(info_span!("resync", generation)),
        );
    }
}
