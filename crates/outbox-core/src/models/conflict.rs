//! Conflict finding model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// What kind of divergence a finding describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    /// Version counters differ
    Version,
    /// Remote copy is strictly newer
    Timestamp,
    /// Both sides changed within the concurrency window
    Concurrent,
    /// Content hashes differ
    Checksum,
    /// Both sides changed the same field away from the original
    ConcurrentField,
}

impl ConflictType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::Timestamp => "timestamp",
            Self::Concurrent => "concurrent",
            Self::Checksum => "checksum",
            Self::ConcurrentField => "concurrent-field",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Evidence that local and remote state diverged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictFinding {
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub field: Option<String>,
    pub local_value: Value,
    pub remote_value: Value,
    pub severity: Severity,
    pub description: String,
}

/// Resolution the detector recommends for a set of findings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuggestedResolution {
    AutoMerge,
    RemoteWins,
    Manual,
}

impl fmt::Display for SuggestedResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AutoMerge => "auto-merge",
            Self::RemoteWins => "remote-wins",
            Self::Manual => "manual",
        })
    }
}

/// Strategy used to settle an optimistic update that conflicted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    /// Adopt the remote value
    #[default]
    LastWriteWins,
    /// Keep the local value
    FirstWriteWins,
    /// Combine both values
    Merge,
    /// Ask the caller
    Manual,
}

impl FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last-write-wins" | "lww" => Ok(Self::LastWriteWins),
            "first-write-wins" | "fww" => Ok(Self::FirstWriteWins),
            "merge" => Ok(Self::Merge),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown resolution strategy '{other}'")),
        }
    }
}

impl From<SuggestedResolution> for ResolutionStrategy {
    fn from(value: SuggestedResolution) -> Self {
        match value {
            SuggestedResolution::AutoMerge => Self::Merge,
            SuggestedResolution::RemoteWins => Self::LastWriteWins,
            SuggestedResolution::Manual => Self::Manual,
        }
    }
}
