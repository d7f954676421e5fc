//! Remote data service abstraction.

mod rest;

pub use rest::RestRemoteService;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// How a failed remote call should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Transport failure or transient server error
    Retryable,
    /// The service rejected the request permanently
    Terminal,
    /// The service reported a concurrent modification
    Conflict,
    /// The call did not finish within the configured timeout
    Timeout,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Retryable => "retryable",
            Self::Terminal => "terminal",
            Self::Conflict => "conflict",
            Self::Timeout => "timeout",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Remote {kind} error: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Retryable, message)
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Terminal, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Conflict, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Timeout, message)
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// A remote table-oriented data service.
///
/// Records are JSON objects addressed by target name and entity id.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Insert one record, returning the stored record
    async fn insert(&self, target: &str, record: &Value) -> RemoteResult<Value>;

    /// Insert several records in one call.
    ///
    /// Services without bulk support keep the default, which makes callers
    /// fall back to single inserts.
    async fn insert_many(&self, target: &str, _records: &[Value]) -> RemoteResult<Vec<Value>> {
        Err(RemoteError::terminal(format!(
            "bulk insert is not supported for '{target}'"
        )))
    }

    /// Apply `changes` to the record with `id`
    async fn update(&self, target: &str, id: &str, changes: &Value) -> RemoteResult<Value>;

    /// Delete the record with `id`
    async fn delete(&self, target: &str, id: &str) -> RemoteResult<()>;

    /// Fetch the current record with `id`, if it exists
    async fn fetch(&self, target: &str, id: &str) -> RemoteResult<Option<Value>>;
}

/// What the dispatcher does with a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Count the failure against the retry budget
    Retry,
    /// Stop retrying and mark the operation failed
    Fail,
    /// Return the operation to pending without spending a retry
    Conflict,
}

/// Decides how a remote error affects an operation's retry budget
pub trait FailureClassifier: Send + Sync {
    fn classify(&self, error: &RemoteError) -> Disposition;
}

/// Retries every failure until the budget runs out
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryAll;

impl FailureClassifier for RetryAll {
    fn classify(&self, error: &RemoteError) -> Disposition {
        match error.kind {
            RemoteErrorKind::Conflict => Disposition::Conflict,
            _ => Disposition::Retry,
        }
    }
}

/// Fails permanently rejected operations without further attempts
#[derive(Debug, Clone, Copy, Default)]
pub struct FailFastOnTerminal;

impl FailureClassifier for FailFastOnTerminal {
    fn classify(&self, error: &RemoteError) -> Disposition {
        match error.kind {
            RemoteErrorKind::Conflict => Disposition::Conflict,
            RemoteErrorKind::Terminal => Disposition::Fail,
            RemoteErrorKind::Retryable | RemoteErrorKind::Timeout => Disposition::Retry,
        }
    }
}
