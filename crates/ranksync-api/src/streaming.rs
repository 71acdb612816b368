//! Collaborator traits: initial loader, change stream and persistence calls
//!
//! The engine never talks to a concrete backend. A realtime transport
//! implements [`ChangeNotifications`], the read API implements
//! [`CollectionLoader`] and the write API implements [`PersistenceBackend`].
//! Anything implementing all three is a [`CollectionBackend`].

use std::pin::Pin;

use async_trait::async_trait;
use tokio_stream::Stream;

use crate::change::ChangeEvent;
use crate::item::{Rank, RankedItem};
use crate::mutation::WriteAck;
use crate::ApiError;

/// Events delivered together by the transport, in channel order
pub type ChangeBatch<T> = Vec<ChangeEvent<T>>;

/// Stream of change batches for one parent collection.
///
/// Errors are delivered in-band; an `Err` means events may have been lost
/// (e.g. the subscriber lagged behind the broadcast buffer).
pub type ChangeStream<T> =
    Pin<Box<dyn Stream<Item = Result<ChangeBatch<T>, ApiError>> + Send>>;

/// Realtime change notifications.
///
/// Delivery is at-least-once and FIFO per channel; no ordering is
/// guaranteed across channels.
///
/// # Example
///
/// ```rust,no_run
/// use ranksync_api::{ChangeNotifications, Track};
/// use tokio_stream::StreamExt;
///
/// async fn example(feed: impl ChangeNotifications<Track>) {
///     let mut stream = feed.watch_changes("playlist-1").await;
///     while let Some(result) = stream.next().await {
///         match result {
///             Ok(batch) => {
///                 for event in batch {
///                     println!("{} {}", event.kind(), event.item_id());
///                 }
///             }
///             Err(e) => eprintln!("Change stream error: {:?}", e),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait ChangeNotifications<T>: Send + Sync {
    /// Subscribe to changes of one parent collection.
    ///
    /// The stream unsubscribes when dropped.
    async fn watch_changes(&self, parent_id: &str) -> ChangeStream<T>;
}

/// Initial snapshot loader, also used for full resyncs
#[async_trait]
pub trait CollectionLoader<T>: Send + Sync {
    /// Load every item of the collection, ranks dense and ascending
    async fn load_collection(&self, parent_id: &str) -> Result<Vec<RankedItem<T>>, ApiError>;
}

/// Backend write API. Both calls are fire-and-await.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    async fn move_item(&self, item_id: &str, new_rank: Rank) -> Result<WriteAck, ApiError>;

    async fn delete_item(&self, item_id: &str) -> Result<WriteAck, ApiError>;
}

/// Helper trait for backends providing all three collaborator roles
pub trait CollectionBackend<T>:
    ChangeNotifications<T> + CollectionLoader<T> + PersistenceBackend
{
}

impl<T, B> CollectionBackend<T> for B where
    B: ChangeNotifications<T> + CollectionLoader<T> + PersistenceBackend
{
}
