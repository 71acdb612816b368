pub mod config;
pub mod engine;
pub mod projection;
pub mod search;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod telemetry;
pub mod testing;
pub mod view;

pub use config::{EngineConfig, SearchConfig};
pub use engine::{EngineEvent, ReconciliationEngine, RollbackPolicy};
pub use session::{CollectionPayload, CollectionSession, PendingMutation, Subscription};
pub use snapshot::CollectionSnapshot;
pub use store::RankedCollectionStore;
pub use view::ProjectedView;
