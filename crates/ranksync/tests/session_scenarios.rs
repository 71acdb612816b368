use std::sync::{Arc, Mutex};
use std::time::Duration;

use ranksync::testing::MemoryCollectionBackend;
use ranksync::{CollectionSession, EngineConfig, EngineEvent, ProjectedView};
use ranksync_api::{
    ApiError, ChangeEvent, MutationOutcome, RankedItem, SortDirection, SortKey, Track,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::timeout;

const PLAYLIST: &str = "playlist-1";
const WAIT: Duration = Duration::from_secs(5);

fn track(id: &str, rank: usize) -> RankedItem<Track> {
    RankedItem::new(id, PLAYLIST, rank, Track::new(format!("Track {}", id)))
}

async fn seeded(ids: &[&str]) -> Arc<MemoryCollectionBackend<Track>> {
    let backend = MemoryCollectionBackend::new();
    backend
        .seed_items(ids.iter().enumerate().map(|(i, id)| track(id, i + 1)).collect())
        .await
        .unwrap();
    Arc::new(backend)
}

async fn open(backend: &Arc<MemoryCollectionBackend<Track>>) -> CollectionSession<Track> {
    CollectionSession::open(PLAYLIST, Arc::clone(backend), EngineConfig::default())
        .await
        .unwrap()
}

async fn wait_for_ids(session: &CollectionSession<Track>, expected: &[&str]) {
    let mut snapshots = session.subscribe();
    let reached = timeout(WAIT, snapshots.wait_for(|snapshot| snapshot.ids() == expected)).await;
    assert!(
        matches!(reached, Ok(Ok(_))),
        "collection never reached {:?}, last seen {:?}",
        expected,
        session.snapshot().ids()
    );
}

async fn wait_for_view(
    session: &CollectionSession<Track>,
    predicate: impl FnMut(&Arc<ProjectedView<Track>>) -> bool,
) -> Arc<ProjectedView<Track>> {
    let mut views = session.view();
    let reached = timeout(WAIT, views.wait_for(predicate))
        .await
        .expect("view did not update in time")
        .expect("session closed");
    Arc::clone(&reached)
}

async fn next_event(
    events: &mut broadcast::Receiver<EngineEvent>,
    mut predicate: impl FnMut(&EngineEvent) -> bool,
) -> EngineEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event was not emitted")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn ranks(session: &CollectionSession<Track>) -> Vec<usize> {
    session.snapshot().items.iter().map(|item| item.rank).collect()
}

#[tokio::test]
async fn test_concurrent_insert_during_drag() {
    let backend = seeded(&["A", "B", "C"]).await;
    backend.hold_writes();
    let session = open(&backend).await;

    let pending = session.request_move("C", 0).await.unwrap();
    assert!(pending.write_id().is_some());
    wait_for_ids(&session, &["C", "A", "B"]).await;

    backend.remote_insert(track("D", 2)).await.unwrap();
    wait_for_ids(&session, &["C", "D", "A", "B"]).await;
    assert_eq!(ranks(&session), vec![1, 2, 3, 4]);

    backend.release_writes();
    assert_eq!(pending.outcome().await, Ok(MutationOutcome::Applied));
    // The backend committed the insert before the move
    wait_for_ids(&session, &["C", "A", "D", "B"]).await;
    let stored: Vec<_> = backend
        .items(PLAYLIST)
        .await
        .into_iter()
        .map(|item| item.id)
        .collect();
    assert_eq!(session.snapshot().ids(), stored);
    assert_eq!(ranks(&session), vec![1, 2, 3, 4]);

    session.close().await;
}

#[tokio::test]
async fn test_unknown_item_in_update_triggers_resync() {
    let backend = seeded(&["A"]).await;
    let session = open(&backend).await;
    let mut events = session.events();
    let mut errors = session.errors();

    let ghost = track("B", 1);
    backend.emit(vec![ChangeEvent::Update {
        before: ghost.clone(),
        after: ghost,
    }]);

    let requested = next_event(&mut events, |event| {
        matches!(event, EngineEvent::ResyncRequested { .. })
    })
    .await;
    assert_eq!(
        requested,
        EngineEvent::ResyncRequested {
            generation: 1,
            reason: Some(ApiError::missing("B")),
        }
    );
    next_event(&mut events, |event| {
        matches!(event, EngineEvent::ResyncCompleted { .. })
    })
    .await;

    assert_eq!(backend.load_count().await, 2);
    assert_eq!(session.snapshot().ids(), vec!["A"]);
    assert!(matches!(errors.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_failed_delete_rolls_back_and_surfaces_error() {
    let backend = seeded(&["A", "B", "C"]).await;
    backend.hold_writes();
    backend.fail_next_write(ApiError::transient("offline")).await;
    let session = open(&backend).await;
    let mut errors = session.errors();

    let pending = session.request_delete("B").await.unwrap();
    wait_for_ids(&session, &["A", "C"]).await;
    assert_eq!(ranks(&session), vec![1, 2]);

    backend.release_writes();
    let outcome = pending.outcome().await;
    assert!(matches!(outcome, Err(ApiError::TransientIo { .. })));
    assert_eq!(session.snapshot().ids(), vec!["A", "B", "C"]);
    assert_eq!(ranks(&session), vec![1, 2, 3]);

    let surfaced = timeout(WAIT, errors.recv()).await.unwrap().unwrap();
    assert_eq!(surfaced, ApiError::transient("offline"));
}

#[tokio::test]
async fn test_conflict_resyncs_without_notification() {
    let backend = seeded(&["A", "B"]).await;
    backend
        .fail_next_write(ApiError::conflict("rank changed concurrently"))
        .await;
    let session = open(&backend).await;
    let mut events = session.events();
    let mut errors = session.errors();

    let pending = session.request_move("B", 0).await.unwrap();
    assert!(matches!(
        pending.outcome().await,
        Err(ApiError::Conflict { .. })
    ));

    next_event(&mut events, |event| {
        matches!(event, EngineEvent::ResyncCompleted { .. })
    })
    .await;
    assert_eq!(session.snapshot().ids(), vec!["A", "B"]);
    assert!(matches!(errors.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_confirming_delete_echo_is_absorbed() {
    let backend = seeded(&["A", "B", "C"]).await;
    let session = open(&backend).await;
    let mut events = session.events();

    let pending = session.request_delete("B").await.unwrap();
    assert_eq!(pending.outcome().await, Ok(MutationOutcome::Applied));

    // The echoed Delete must not be mistaken for an unknown item
    backend.remote_insert(track("D", 3)).await.unwrap();
    wait_for_ids(&session, &["A", "C", "D"]).await;
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(backend.load_count().await, 1);
}

#[tokio::test]
async fn test_stream_error_triggers_resync() {
    let backend = seeded(&["A", "B"]).await;
    let session = open(&backend).await;
    let mut events = session.events();

    // Changes the session never hears about, then a lag report
    backend.seed_items(vec![track("C", 3)]).await.unwrap();
    backend.emit_error(ApiError::transient("change feed lagged"));

    next_event(&mut events, |event| {
        matches!(event, EngineEvent::ResyncCompleted { .. })
    })
    .await;
    assert_eq!(session.snapshot().ids(), vec!["A", "B", "C"]);
}

#[tokio::test]
async fn test_read_only_collection_rejects_local_edits() {
    let backend = seeded(&["A", "B"]).await;
    let session = open(&backend).await;

    session.set_can_edit(false).unwrap();
    let err = session.request_delete("A").await.unwrap_err();
    assert!(matches!(err, ApiError::PermissionDenied { .. }));

    session.set_can_edit(true).unwrap();
    let pending = session.request_move("A", 0).await.unwrap();
    assert_eq!(pending.write_id(), None);
    assert_eq!(pending.outcome().await, Ok(MutationOutcome::NoOp));
    assert!(backend.write_log().await.is_empty());
}

#[tokio::test]
async fn test_invalid_target_is_rejected_synchronously() {
    let backend = seeded(&["A", "B"]).await;
    let session = open(&backend).await;

    let err = session.request_move("A", 5).await.unwrap_err();
    assert!(matches!(err, ApiError::Validation { .. }));
    assert_eq!(session.snapshot().ids(), vec!["A", "B"]);
}

#[tokio::test]
async fn test_empty_query_restores_sorted_view() {
    let backend = Arc::new(MemoryCollectionBackend::new());
    backend
        .seed_items(vec![
            RankedItem::new("1", PLAYLIST, 1, Track::new("Heroes").by("David Bowie")),
            RankedItem::new("2", PLAYLIST, 2, Track::new("Blue Monday").by("New Order")),
            RankedItem::new("3", PLAYLIST, 3, Track::new("Atmosphere").by("Joy Division")),
        ])
        .await
        .unwrap();
    let session = open(&backend).await;

    session.set_sort(SortKey::Title, SortDirection::Ascending).unwrap();
    session.set_search_query("bowie").unwrap();
    let filtered = wait_for_view(&session, |view| view.query.is_some()).await;
    assert_eq!(filtered.ids(), vec!["1"]);

    session.set_search_query("").unwrap();
    let full = wait_for_view(&session, |view| view.query.is_none()).await;
    assert_eq!(full.ids(), vec!["3", "2", "1"]);
    assert_eq!(full.total, 3);
}

#[tokio::test]
async fn test_subscribe_fn_sees_every_published_snapshot() {
    let backend = seeded(&["A"]).await;
    let session = open(&backend).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscription = {
        let seen = Arc::clone(&seen);
        session.subscribe_fn(move |items| {
            let ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();
            seen.lock().unwrap().push(ids);
        })
    };

    wait_until(|| seen.lock().unwrap().len() == 1).await;

    backend.remote_insert(track("B", 2)).await.unwrap();
    wait_until(|| seen.lock().unwrap().last().map(Vec::len) == Some(2)).await;

    subscription.unsubscribe();
    assert_eq!(seen.lock().unwrap().first(), Some(&vec!["A".to_string()]));
}

#[tokio::test]
async fn test_close_resolves_outstanding_mutations() {
    let backend = seeded(&["A", "B"]).await;
    backend.hold_writes();
    let session = open(&backend).await;

    let pending = session.request_delete("A").await.unwrap();
    session.close().await;

    assert_eq!(pending.outcome().await, Err(ApiError::Closed));
}
