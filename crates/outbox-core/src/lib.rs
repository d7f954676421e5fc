//! outbox-core - Core library for Outbox
//!
//! This crate contains the durable operation queue, conflict detection,
//! optimistic updates, priority scheduling, batch dispatch and the sync
//! engine that ties them together for offline-first clients.

pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod optimistic;
pub mod remote;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;

pub use config::EngineConfig;
pub use connectivity::Connectivity;
pub use engine::{OptimisticMutation, QueueOutcome, ShutdownReport, SyncEngine, SyncEngineBuilder};
pub use error::{DurabilityDegraded, Error, Result};
pub use events::{EventBus, EventKind, Subscription, SyncEvent};
pub use models::{Operation, OperationId, OperationKind, OperationStatus, Priority, SyncProgress};
pub use remote::{RemoteError, RemoteService, RestRemoteService};
pub use state::SyncState;
pub use store::OperationStore;
