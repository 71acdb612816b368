use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ranksync::testing::MemoryCollectionBackend;
use ranksync::{CollectionSession, EngineConfig, PendingMutation, ProjectedView};
use ranksync_api::{ApiError, RankedItem, SortDirection, SortSpec, Track};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::scenario::{Scenario, ScenarioTrack, Step};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ScenarioRunner {
    playlist: String,
    min_query_len: usize,
    backend: Arc<MemoryCollectionBackend<Track>>,
    session: CollectionSession<Track>,
}

impl ScenarioRunner {
    pub async fn start(scenario: &Scenario, config: EngineConfig) -> Result<Self> {
        let backend = Arc::new(MemoryCollectionBackend::new());
        let items = scenario
            .tracks
            .iter()
            .enumerate()
            .map(|(index, track)| ranked(&scenario.playlist, track, index))
            .collect();
        backend.seed_items(items).await?;

        let min_query_len = config.search.min_query_len;
        let session =
            CollectionSession::open(&scenario.playlist, Arc::clone(&backend), config).await?;

        let mut notifications = session.errors();
        tokio::spawn(async move {
            while let Ok(error) = notifications.recv().await {
                println!("   ! {}", error);
            }
        });

        Ok(Self {
            playlist: scenario.playlist.clone(),
            min_query_len,
            backend,
            session,
        })
    }

    pub async fn run(&self, steps: &[Step]) -> Result<()> {
        for (number, step) in steps.iter().enumerate() {
            info!(step = number + 1, ?step, "executing step");
            self.execute(step).await?;
        }
        Ok(())
    }

    pub async fn finish(self) {
        self.session.close().await;
    }

    async fn execute(&self, step: &Step) -> Result<()> {
        match step {
            Step::Move { id, index } => {
                println!("> move {} to {}", id, index);
                let pending = self.session.request_move(id, *index).await;
                self.report(pending).await;
            }
            Step::Delete(id) => {
                println!("> delete {}", id);
                let pending = self.session.request_delete(id).await;
                self.report(pending).await;
            }
            Step::RemoteInsert { track, index } => {
                let item = ranked(&self.playlist, track, *index);
                println!("> remote insert {} at {}", item.id, index);
                self.backend.remote_insert(item).await?;
                self.settle().await;
            }
            Step::RemoteMove { id, index } => {
                println!("> remote move {} to {}", id, index);
                self.backend.remote_move(id, index + 1).await?;
                self.settle().await;
            }
            Step::RemoteDelete(id) => {
                println!("> remote delete {}", id);
                self.backend.remote_delete(id).await?;
                self.settle().await;
            }
            Step::FailNextWrite(message) => {
                self.backend
                    .fail_next_write(ApiError::transient(message.as_str()))
                    .await;
            }
            Step::ConflictNextWrite(message) => {
                self.backend
                    .fail_next_write(ApiError::conflict(message.as_str()))
                    .await;
            }
            Step::Sort { key, direction } => {
                let spec = SortSpec::new(*key, *direction);
                self.session.set_sort(*key, *direction)?;
                self.wait_for_view(|view| view.sort == spec).await;
            }
            Step::Search(query) => {
                self.session.set_search_query(query.as_str())?;
                let trimmed = query.trim();
                let expected = (!trimmed.is_empty()
                    && trimmed.chars().count() >= self.min_query_len)
                    .then(|| trimmed.to_string());
                self.wait_for_view(|view| view.query == expected).await;
            }
            Step::Resync => {
                println!("> resync");
                self.session.resync()?;
                self.settle().await;
            }
            Step::Print => print_view(&self.session.current_view()),
        }
        Ok(())
    }

    async fn report(&self, pending: Result<PendingMutation, ApiError>) {
        match pending {
            Ok(pending) => match pending.outcome().await {
                Ok(outcome) => println!("   {:?}", outcome),
                Err(error) => println!("   rolled back: {}", error),
            },
            Err(error) => println!("   rejected: {}", error),
        }
        self.settle().await;
    }

    /// Wait until the session shows what the backend holds
    async fn settle(&self) {
        let mut snapshots = self.session.subscribe();
        let expected: Vec<String> = self
            .backend
            .items(&self.playlist)
            .await
            .into_iter()
            .map(|item| item.id)
            .collect();
        let settled = timeout(
            SETTLE_TIMEOUT,
            snapshots.wait_for(|snapshot| snapshot.ids() == expected),
        )
        .await;
        if !matches!(settled, Ok(Ok(_))) {
            warn!(?expected, "session did not converge with backend");
        }
    }

    async fn wait_for_view(&self, predicate: impl FnMut(&Arc<ProjectedView<Track>>) -> bool) {
        let mut views = self.session.view();
        if timeout(SETTLE_TIMEOUT, views.wait_for(predicate)).await.is_err() {
            warn!("view did not update in time");
        }
    }
}

fn ranked(playlist: &str, track: &ScenarioTrack, index: usize) -> RankedItem<Track> {
    let id = track
        .id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    RankedItem::new(id, playlist, index + 1, track.track.clone())
}

fn print_view(view: &ProjectedView<Track>) {
    let direction = match view.sort.direction {
        SortDirection::Ascending => "ascending",
        SortDirection::Descending => "descending",
    };
    let query = view
        .query
        .as_deref()
        .map(|query| format!(", query \"{}\"", query))
        .unwrap_or_default();
    println!(
        "-- {:?} {}{} ({} of {}, v{})",
        view.sort.key,
        direction,
        query,
        view.items.len(),
        view.total,
        view.snapshot_version
    );
    for (position, item) in view.items.iter().enumerate() {
        let track = &item.payload;
        let artist = track
            .artist
            .as_deref()
            .map(|artist| format!(" - {}", artist))
            .unwrap_or_default();
        let released = track
            .release_date
            .map(|date| format!(" ({})", date.format("%Y-%m-%d")))
            .unwrap_or_default();
        println!(
            "{:>3}. #{:<3} {}{}{}  [{}]",
            position + 1,
            item.rank,
            track.title,
            artist,
            released,
            item.id
        );
    }
}
