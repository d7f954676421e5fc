//! Sync progress model

use serde::{Deserialize, Serialize};

/// Aggregate outcome of one `sync_all` run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Operations offered to the dispatcher
    pub total: usize,
    /// Operations accepted by the remote service and removed from the queue
    pub completed: usize,
    /// Operations whose attempt failed during this run. Writes the service
    /// refused as conflicting stay queued and are not counted.
    pub failed: usize,
    /// `completed` as a whole percentage of `total`
    pub percentage: u8,
}

impl SyncProgress {
    #[must_use]
    pub fn new(total: usize, completed: usize, failed: usize) -> Self {
        let percentage = if total == 0 {
            0
        } else {
            u8::try_from(completed.min(total) * 100 / total).unwrap_or(100)
        };
        Self {
            total,
            completed,
            failed,
            percentage,
        }
    }

    /// Result returned when a run was skipped
    pub const fn none() -> Self {
        Self {
            total: 0,
            completed: 0,
            failed: 0,
            percentage: 0,
        }
    }
}
