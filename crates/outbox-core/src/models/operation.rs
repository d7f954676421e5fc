//! Operation model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default number of attempts an operation gets before it is marked failed
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A unique identifier for a queued operation, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Create a new unique operation ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The mutation an operation carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Whether the payload must name the entity it touches
    pub const fn requires_entity_id(self) -> bool {
        matches!(self, Self::Update | Self::Delete)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" | "insert" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown operation kind '{other}'")),
        }
    }
}

/// Lifecycle status of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Processing,
    Failed,
    Completed,
}

impl OperationStatus {
    pub const ALL: [Self; 4] = [
        Self::Pending,
        Self::Processing,
        Self::Failed,
        Self::Completed,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown operation status '{other}'")),
        }
    }
}

/// A pending mutation intent against the remote service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique identifier
    pub id: OperationId,
    /// Enqueue timestamp (Unix ms)
    pub created_at: i64,
    pub kind: OperationKind,
    /// Logical table/collection name
    pub target: String,
    /// Opaque record data
    pub payload: Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: OperationStatus,
    pub last_error: Option<String>,
    /// When the remote service accepted the operation (Unix ms)
    pub synced_at: Option<i64>,
}

impl Operation {
    /// Create a new pending operation
    #[must_use]
    pub fn new(kind: OperationKind, target: impl Into<String>, payload: Value) -> Self {
        Self {
            id: OperationId::new(),
            created_at: chrono::Utc::now().timestamp_millis(),
            kind,
            target: target.into(),
            payload,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            status: OperationStatus::Pending,
            last_error: None,
            synced_at: None,
        }
    }

    /// Set the retry budget fixed at enqueue time
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Identifier of the entity this operation touches, read from `payload.id`
    pub fn entity_id(&self) -> Option<String> {
        entity_id_of(&self.payload)
    }

    /// Check that the payload carries what the kind needs
    pub fn validate(&self) -> crate::Result<()> {
        if self.target.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "operation target must not be empty".into(),
            ));
        }
        if self.kind.requires_entity_id() && self.entity_id().is_none() {
            return Err(crate::Error::InvalidInput(format!(
                "{} operation on '{}' requires a payload id",
                self.kind, self.target
            )));
        }
        Ok(())
    }

    /// Whether one more failure exhausts the retry budget
    pub const fn is_last_attempt(&self) -> bool {
        self.max_retries > 0 && self.retry_count + 1 == self.max_retries
    }

    /// Whether the scheduler may still offer this operation
    pub const fn is_dispatchable(&self) -> bool {
        matches!(self.status, OperationStatus::Pending) && self.retry_count < self.max_retries
    }
}

/// Read an entity identifier from a record's `id` field.
///
/// String and integer ids are accepted; anything else counts as absent.
pub fn entity_id_of(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(id) if !id.trim().is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Partial update applied to a stored operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationPatch {
    pub status: Option<OperationStatus>,
    pub retry_count: Option<u32>,
    /// `Some(None)` clears the stored error
    pub last_error: Option<Option<String>>,
    pub synced_at: Option<i64>,
}

impl OperationPatch {
    pub fn status(status: OperationStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(Some(error.into()));
        self
    }

    #[must_use]
    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    #[must_use]
    pub const fn with_synced_at(mut self, synced_at: i64) -> Self {
        self.synced_at = Some(synced_at);
        self
    }

    /// Apply the patch to an in-memory operation
    pub fn apply_to(&self, operation: &mut Operation) {
        if let Some(status) = self.status {
            operation.status = status;
        }
        if let Some(retry_count) = self.retry_count {
            operation.retry_count = retry_count;
        }
        if let Some(last_error) = &self.last_error {
            operation.last_error.clone_from(last_error);
        }
        if let Some(synced_at) = self.synced_at {
            operation.synced_at = Some(synced_at);
        }
    }
}
