//! Engine-wide sync state.

use std::fmt;

use serde::Serialize;

use crate::models::SyncProgress;

/// Sync state published to hosts through [`crate::SyncEngine::subscribe_state`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// No connectivity; operations are queued
    Offline,
    Syncing,
    /// Last run finished without failures
    Synced,
    /// Last run left failed attempts behind
    Error,
}

impl SyncState {
    /// State after a run that produced `progress`
    pub const fn after(progress: &SyncProgress) -> Self {
        if progress.failed == 0 {
            Self::Synced
        } else {
            Self::Error
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
