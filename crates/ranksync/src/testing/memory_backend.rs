//! In-memory implementation of the collaborator traits
//!
//! Holds ranked collections in plain vectors and broadcasts every change on a
//! single feed shared by all collections, the way a realtime channel would.
//! Test hooks allow gating writes, injecting failures and emitting arbitrary
//! (even inconsistent) event batches.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use ranksync_api::{
    ApiError, ChangeBatch, ChangeEvent, ChangeNotifications, ChangeStream, CollectionLoader,
    ItemId, LocalMutationRequest, ParentId, PersistenceBackend, Rank, RankedItem, WriteAck,
};
use tokio::sync::{broadcast, watch, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::debug;

const DEFAULT_FEED_CAPACITY: usize = 256;

/// In-memory ranked collections with a broadcast change feed.
///
/// Cloning yields another handle to the same backend.
///
/// # Example
///
/// ```rust,no_run
/// use ranksync::testing::MemoryCollectionBackend;
/// use ranksync_api::{ApiError, RankedItem, Track};
///
/// async fn example() -> Result<(), ApiError> {
///     let backend = MemoryCollectionBackend::<Track>::new();
///     backend
///         .seed_items(vec![RankedItem::new("t1", "playlist", 1, Track::new("Heroes"))])
///         .await?;
///     backend.fail_next_write(ApiError::transient("offline")).await;
///     backend.remote_insert(RankedItem::new("t2", "playlist", 1, Track::new("Low"))).await?;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct MemoryCollectionBackend<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for MemoryCollectionBackend<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Debug)]
struct Inner<T> {
    state: Mutex<MemoryState<T>>,
    feed: broadcast::Sender<Result<ChangeBatch<T>, ApiError>>,
    /// `true` while writes are held
    gate: watch::Sender<bool>,
}

#[derive(Debug)]
struct MemoryState<T> {
    /// Items per parent, ordered by rank
    collections: HashMap<ParentId, Vec<RankedItem<T>>>,
    parent_of: HashMap<ItemId, ParentId>,
    write_failures: VecDeque<ApiError>,
    load_failures: VecDeque<ApiError>,
    echo_writes: bool,
    load_count: usize,
    write_log: Vec<LocalMutationRequest>,
}

impl<T: Clone> MemoryState<T> {
    fn collection_of(&mut self, item_id: &str) -> Option<&mut Vec<RankedItem<T>>> {
        let parent_id = self.parent_of.get(item_id)?;
        self.collections.get_mut(parent_id)
    }

    fn insert(&mut self, item: RankedItem<T>) -> Result<ChangeEvent<T>, ApiError> {
        if self.parent_of.contains_key(&item.id) {
            return Err(ApiError::conflict(format!("item {} already exists", item.id)));
        }
        let items = self.collections.entry(item.parent_id.clone()).or_default();
        if item.rank == 0 || item.rank > items.len() + 1 {
            return Err(ApiError::conflict(format!(
                "insert rank {} outside 1..={}",
                item.rank,
                items.len() + 1
            )));
        }
        items.insert(item.rank - 1, item.clone());
        renumber(items);
        self.parent_of.insert(item.id.clone(), item.parent_id.clone());
        Ok(ChangeEvent::Insert { item })
    }

    fn move_item(&mut self, item_id: &str, new_rank: Rank) -> Result<ChangeEvent<T>, ApiError> {
        let items = self
            .collection_of(item_id)
            .ok_or_else(|| ApiError::conflict(format!("item {} does not exist", item_id)))?;
        if new_rank == 0 || new_rank > items.len() {
            return Err(ApiError::conflict(format!(
                "move rank {} outside 1..={}",
                new_rank,
                items.len()
            )));
        }
        let index = position(items, item_id)?;
        let before = items.remove(index);
        let after = before.clone().with_rank(new_rank);
        items.insert(new_rank - 1, after.clone());
        renumber(items);
        Ok(ChangeEvent::Update { before, after })
    }

    fn delete(&mut self, item_id: &str) -> Result<ChangeEvent<T>, ApiError> {
        let items = self
            .collection_of(item_id)
            .ok_or_else(|| ApiError::conflict(format!("item {} does not exist", item_id)))?;
        let index = position(items, item_id)?;
        let item = items.remove(index);
        renumber(items);
        self.parent_of.remove(item_id);
        Ok(ChangeEvent::Delete { item })
    }
}

fn position<T>(items: &[RankedItem<T>], item_id: &str) -> Result<usize, ApiError> {
    items
        .iter()
        .position(|item| item.id == item_id)
        .ok_or_else(|| ApiError::conflict(format!("item {} does not exist", item_id)))
}

fn renumber<T>(items: &mut [RankedItem<T>]) {
    for (index, item) in items.iter_mut().enumerate() {
        item.rank = index + 1;
    }
}

impl<T: Clone + Send + Sync + 'static> Default for MemoryCollectionBackend<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> MemoryCollectionBackend<T> {
    pub fn new() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }

    /// A small capacity makes slow subscribers lag, which surfaces as a
    /// stream error on their change stream.
    pub fn with_feed_capacity(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity.max(1));
        let (gate, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(MemoryState {
                    collections: HashMap::new(),
                    parent_of: HashMap::new(),
                    write_failures: VecDeque::new(),
                    load_failures: VecDeque::new(),
                    echo_writes: true,
                    load_count: 0,
                    write_log: Vec::new(),
                }),
                feed,
                gate,
            }),
        }
    }

    /// Insert items without publishing change events
    pub async fn seed_items(&self, items: Vec<RankedItem<T>>) -> Result<(), ApiError> {
        let mut items = items;
        items.sort_by_key(|item| item.rank);
        let mut state = self.inner.state.lock().await;
        for item in items {
            state.insert(item)?;
        }
        Ok(())
    }

    /// Current items of a collection in rank order
    pub async fn items(&self, parent_id: &str) -> Vec<RankedItem<T>> {
        let state = self.inner.state.lock().await;
        state.collections.get(parent_id).cloned().unwrap_or_default()
    }

    /// Broadcast a batch as-is, without touching stored state
    pub fn emit(&self, batch: ChangeBatch<T>) {
        self.broadcast(Ok(batch));
    }

    /// Deliver a transport error to every subscriber
    pub fn emit_error(&self, error: ApiError) {
        self.broadcast(Err(error));
    }

    fn broadcast(&self, item: Result<ChangeBatch<T>, ApiError>) {
        if self.inner.feed.send(item).is_err() {
            debug!("change emitted with no subscribers");
        }
    }

    /// Apply a change made by another writer and broadcast it
    pub async fn remote_insert(&self, item: RankedItem<T>) -> Result<RankedItem<T>, ApiError> {
        let event = self.inner.state.lock().await.insert(item.clone())?;
        self.emit(vec![event]);
        Ok(item)
    }

    pub async fn remote_move(&self, item_id: &str, new_rank: Rank) -> Result<(), ApiError> {
        let event = self.inner.state.lock().await.move_item(item_id, new_rank)?;
        self.emit(vec![event]);
        Ok(())
    }

    pub async fn remote_delete(&self, item_id: &str) -> Result<(), ApiError> {
        let event = self.inner.state.lock().await.delete(item_id)?;
        self.emit(vec![event]);
        Ok(())
    }

    /// Make the next write call fail with `error` (queued, first in first out)
    pub async fn fail_next_write(&self, error: ApiError) {
        self.inner.state.lock().await.write_failures.push_back(error);
    }

    pub async fn fail_next_load(&self, error: ApiError) {
        self.inner.state.lock().await.load_failures.push_back(error);
    }

    /// Block write calls until [`release_writes`](Self::release_writes)
    pub fn hold_writes(&self) {
        self.inner.gate.send_replace(true);
    }

    pub fn release_writes(&self) {
        self.inner.gate.send_replace(false);
    }

    /// Whether successful writes are broadcast back as change events
    pub async fn set_echo_writes(&self, echo: bool) {
        self.inner.state.lock().await.echo_writes = echo;
    }

    /// Number of `load_collection` calls so far
    pub async fn load_count(&self) -> usize {
        self.inner.state.lock().await.load_count
    }

    /// Every write call received, including failed ones
    pub async fn write_log(&self) -> Vec<LocalMutationRequest> {
        self.inner.state.lock().await.write_log.clone()
    }

    async fn wait_for_release(&self) {
        let mut gate = self.inner.gate.subscribe();
        // The sender lives as long as `self`
        let _ = gate.wait_for(|held| !*held).await;
    }

    async fn write(
        &self,
        request: LocalMutationRequest,
        apply: impl FnOnce(&mut MemoryState<T>) -> Result<ChangeEvent<T>, ApiError>,
    ) -> Result<WriteAck, ApiError> {
        self.wait_for_release().await;

        let mut state = self.inner.state.lock().await;
        state.write_log.push(request);
        if let Some(error) = state.write_failures.pop_front() {
            return Err(error);
        }
        let event = apply(&mut *state)?;
        if state.echo_writes {
            self.emit(vec![event]);
        }
        Ok(WriteAck)
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> ChangeNotifications<T> for MemoryCollectionBackend<T> {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn watch_changes(&self, parent_id: &str) -> ChangeStream<T> {
        debug!("subscribing to change feed");
        let stream = BroadcastStream::new(self.inner.feed.subscribe()).map(|received| {
            received
                .map_err(|err| ApiError::transient(format!("change feed: {}", err)))
                .and_then(|batch| batch)
        });
        Box::pin(stream)
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> CollectionLoader<T> for MemoryCollectionBackend<T> {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn load_collection(&self, parent_id: &str) -> Result<Vec<RankedItem<T>>, ApiError> {
        let mut state = self.inner.state.lock().await;
        state.load_count += 1;
        if let Some(error) = state.load_failures.pop_front() {
            return Err(error);
        }
        Ok(state.collections.get(parent_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> PersistenceBackend for MemoryCollectionBackend<T> {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn move_item(&self, item_id: &str, new_rank: Rank) -> Result<WriteAck, ApiError> {
        let request = LocalMutationRequest::Move {
            item_id: item_id.to_string(),
            target_rank: new_rank,
        };
        self.write(request, |state| state.move_item(item_id, new_rank))
            .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_item(&self, item_id: &str) -> Result<WriteAck, ApiError> {
        self.write(LocalMutationRequest::delete(item_id), |state| {
            state.delete(item_id)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MemoryCollectionBackend<String> {
        MemoryCollectionBackend::new()
    }

    async fn seeded(ids: &[&str]) -> MemoryCollectionBackend<String> {
        let backend = backend();
        backend
            .seed_items(
                ids.iter()
                    .enumerate()
                    .map(|(i, id)| RankedItem::new(*id, "p", i + 1, id.to_string()))
                    .collect(),
            )
            .await
            .unwrap();
        backend
    }

    async fn ids(backend: &MemoryCollectionBackend<String>) -> Vec<String> {
        backend
            .items("p")
            .await
            .into_iter()
            .map(|item| item.id)
            .collect()
    }

    #[tokio::test]
    async fn test_writes_update_state_and_echo() {
        let backend = seeded(&["a", "b", "c"]).await;
        let mut feed = backend.watch_changes("p").await;

        backend.move_item("c", 1).await.unwrap();
        assert_eq!(ids(&backend).await, vec!["c", "a", "b"]);

        let batch = feed.next().await.unwrap().unwrap();
        assert!(matches!(
            &batch[..],
            [ChangeEvent::Update { before, after }] if before.rank == 3 && after.rank == 1
        ));

        backend.delete_item("a").await.unwrap();
        assert_eq!(ids(&backend).await, vec!["c", "b"]);
        assert_eq!(backend.write_log().await.len(), 2);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let backend = seeded(&["a"]).await;
        backend.fail_next_write(ApiError::transient("offline")).await;
        backend.fail_next_load(ApiError::transient("offline")).await;

        assert!(backend.delete_item("a").await.is_err());
        assert_eq!(ids(&backend).await, vec!["a"]);
        assert!(backend.load_collection("p").await.is_err());
        assert_eq!(backend.load_collection("p").await.unwrap().len(), 1);
        assert_eq!(backend.load_count().await, 2);

        let err = backend.move_item("zzz", 1).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_held_writes_wait_for_release() {
        let backend = seeded(&["a", "b"]).await;
        backend.hold_writes();

        let writer = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.move_item("b", 1).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(ids(&backend).await, vec!["a", "b"]);

        backend.release_writes();
        writer.await.unwrap().unwrap();
        assert_eq!(ids(&backend).await, vec!["b", "a"]);
    }

    /// Records the name of every span opened while installed
    #[derive(Clone, Default)]
    struct SpanNames(Arc<std::sync::Mutex<Vec<String>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for SpanNames {
        fn on_new_span(
            &self,
            attrs: &tracing::span::Attributes<'_>,
            _id: &tracing::span::Id,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            self.0.lock().unwrap().push(attrs.metadata().name().to_string());
        }
    }

    #[tokio::test]
    async fn test_collaborator_calls_open_spans() {
        use tracing_subscriber::layer::SubscriberExt;

        let spans = SpanNames::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(spans.clone()));

        let backend = seeded(&["a", "b"]).await;
        let _feed = backend.watch_changes("p").await;
        backend.load_collection("p").await.unwrap();
        backend.move_item("b", 1).await.unwrap();
        backend.delete_item("a").await.unwrap();

        let names = spans.0.lock().unwrap().clone();
        for call in ["watch_changes", "load_collection", "move_item", "delete_item"] {
            assert!(names.iter().any(|name| name == call), "no span for {}: {:?}", call, names);
        }
    }

    #[tokio::test]
    async fn test_lagging_subscriber_gets_stream_error() {
        let backend = MemoryCollectionBackend::<String>::with_feed_capacity(1);
        let mut feed = backend.watch_changes("p").await;
        backend.emit(Vec::new());
        backend.emit(Vec::new());
        backend.emit(Vec::new());

        let first = feed.next().await.unwrap();
        assert!(matches!(first, Err(ApiError::TransientIo { .. })));
    }
}
