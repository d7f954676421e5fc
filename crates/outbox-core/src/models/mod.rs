//! Data models for Outbox

mod conflict;
mod operation;
mod priority;
mod progress;

pub use conflict::{ConflictFinding, ConflictType, ResolutionStrategy, Severity, SuggestedResolution};
pub use operation::{
    entity_id_of, Operation, OperationId, OperationKind, OperationPatch, OperationStatus,
    DEFAULT_MAX_RETRIES,
};
pub use priority::Priority;
pub use progress::SyncProgress;
