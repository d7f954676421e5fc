//! Batch dispatch of queued operations to the remote service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::models::{entity_id_of, Operation, OperationKind, OperationPatch, OperationStatus};
use crate::remote::{
    Disposition, FailureClassifier, RemoteError, RemoteResult, RemoteService, RetryAll,
};
use crate::store::OperationStore;
use crate::util::now_millis;

/// Operations sharing a target and kind, dispatched together
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub target: String,
    pub kind: OperationKind,
    pub operations: Vec<Operation>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Partition operations by `(target, kind)`, oldest first within a group,
/// splitting groups larger than `max_batch_size`.
///
/// Groups appear in the order their first operation was given.
pub fn group_into_batches(operations: Vec<Operation>, max_batch_size: usize) -> Vec<Batch> {
    let max_batch_size = max_batch_size.max(1);
    let mut groups: Vec<Batch> = Vec::new();

    for operation in operations {
        match groups
            .iter_mut()
            .find(|group| group.target == operation.target && group.kind == operation.kind)
        {
            Some(group) => group.operations.push(operation),
            None => groups.push(Batch {
                target: operation.target.clone(),
                kind: operation.kind,
                operations: vec![operation],
            }),
        }
    }

    let mut batches = Vec::new();
    for mut group in groups {
        group.operations.sort_by_key(|operation| operation.created_at);
        let mut operations = group.operations.into_iter().peekable();
        while operations.peek().is_some() {
            batches.push(Batch {
                target: group.target.clone(),
                kind: group.kind,
                operations: operations.by_ref().take(max_batch_size).collect(),
            });
        }
    }
    batches
}

/// What happened to one operation of a batch
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    /// Applied remotely; `response` is what the service returned
    Synced {
        operation: Operation,
        response: Option<Value>,
    },
    /// Rejected or unreachable; `operation` carries the updated retry state
    Failed {
        operation: Operation,
        error: RemoteError,
    },
    /// The service reported a concurrent modification
    Conflict {
        operation: Operation,
        error: RemoteError,
    },
}

impl OperationOutcome {
    pub const fn operation(&self) -> &Operation {
        match self {
            Self::Synced { operation, .. }
            | Self::Failed { operation, .. }
            | Self::Conflict { operation, .. } => operation,
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Synced { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub target: String,
    pub kind: OperationKind,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
    pub outcomes: Vec<OperationOutcome>,
}

/// Executes batches against the remote service and records each outcome in
/// the store.
pub struct BatchDispatcher {
    remote: Arc<dyn RemoteService>,
    store: Arc<OperationStore>,
    classifier: Arc<dyn FailureClassifier>,
    timeout: Duration,
    max_batch_size: usize,
    max_concurrent_batches: usize,
}

impl BatchDispatcher {
    pub fn new(
        remote: Arc<dyn RemoteService>,
        store: Arc<OperationStore>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            remote,
            store,
            classifier: Arc::new(RetryAll),
            timeout: config.remote_timeout(),
            max_batch_size: config.max_batch_size,
            max_concurrent_batches: config.max_concurrent_batches,
        }
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub const fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub const fn max_concurrent_batches(&self) -> usize {
        self.max_concurrent_batches
    }

    pub fn group_into_batches(&self, operations: Vec<Operation>) -> Vec<Batch> {
        group_into_batches(operations, self.max_batch_size)
    }

    /// Run a remote call, turning an elapsed timeout into a retryable error
    async fn timed<T>(
        &self,
        call: impl std::future::Future<Output = RemoteResult<T>> + Send,
    ) -> RemoteResult<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(RemoteError::timeout(format!(
                    "no response within {} ms",
                    self.timeout.as_millis()
                )))
            })
    }

    /// Apply one operation remotely without touching the store
    pub async fn attempt(&self, operation: &Operation) -> RemoteResult<Option<Value>> {
        let target = operation.target.as_str();
        match operation.kind {
            OperationKind::Create => self
                .timed(self.remote.insert(target, &operation.payload))
                .await
                .map(Some),
            OperationKind::Update => {
                let id = entity_id_for(operation)?;
                self.timed(self.remote.update(target, &id, &operation.payload))
                    .await
                    .map(Some)
            }
            OperationKind::Delete => {
                let id = entity_id_for(operation)?;
                self.timed(self.remote.delete(target, &id)).await?;
                Ok(None)
            }
        }
    }

    /// Fetch the current remote copy of an entity
    pub async fn fetch(&self, target: &str, id: &str) -> RemoteResult<Option<Value>> {
        self.timed(self.remote.fetch(target, id)).await
    }

    /// Execute one batch.
    ///
    /// Creates go out as a single bulk insert first; if that fails each
    /// operation is inserted on its own, as is any record the bulk response
    /// left out. Updates and deletes always run one
    /// by one, in order.
    pub async fn execute(&self, batch: Batch) -> BatchResult {
        let started = Instant::now();
        let Batch {
            target,
            kind,
            operations,
        } = batch;

        let mut claimed = Vec::with_capacity(operations.len());
        for operation in operations {
            match self.claim(&operation).await {
                Ok(Some(operation)) => claimed.push(operation),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!("Failed to claim operation {}: {}", operation.id, error);
                }
            }
        }

        let mut outcomes = Vec::with_capacity(claimed.len());
        let bulk = if kind == OperationKind::Create && claimed.len() > 1 {
            self.bulk_insert(&target, &claimed).await
        } else {
            None
        };

        match bulk {
            Some(responses) => {
                for (operation, response) in claimed.into_iter().zip(responses) {
                    let result = match response {
                        Some(response) => Ok(Some(response)),
                        None => self.attempt(&operation).await,
                    };
                    outcomes.push(self.record(operation, result).await);
                }
            }
            None => {
                for operation in claimed {
                    let result = self.attempt(&operation).await;
                    outcomes.push(self.record(operation, result).await);
                }
            }
        }

        let successful = outcomes.iter().filter(|outcome| outcome.is_success()).count();
        let errors: Vec<String> = outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                OperationOutcome::Failed { operation, error }
                | OperationOutcome::Conflict { operation, error } => {
                    Some(format!("{}: {}", operation.id, error))
                }
                OperationOutcome::Synced { .. } => None,
            })
            .collect();
        let result = BatchResult {
            target,
            kind,
            total: outcomes.len(),
            successful,
            failed: outcomes.len() - successful,
            errors,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            outcomes,
        };

        tracing::debug!(
            "Batch {} on '{}': {}/{} succeeded in {} ms",
            result.kind,
            result.target,
            result.successful,
            result.total,
            result.duration_ms
        );
        result
    }

    /// Execute batches in chunks of `max_concurrent_batches`; chunks run one
    /// after another.
    pub async fn dispatch_all(&self, batches: Vec<Batch>) -> Vec<BatchResult> {
        let chunk_size = self.max_concurrent_batches.max(1);
        let mut results = Vec::with_capacity(batches.len());
        let mut batches = batches.into_iter().peekable();

        while batches.peek().is_some() {
            let chunk: Vec<Batch> = batches.by_ref().take(chunk_size).collect();
            results.extend(join_all(chunk.into_iter().map(|batch| self.execute(batch))).await);
        }
        results
    }

    /// One slot per operation: the stored record, or `None` when the service
    /// did not confirm that operation.
    async fn bulk_insert(
        &self,
        target: &str,
        operations: &[Operation],
    ) -> Option<Vec<Option<Value>>> {
        let records: Vec<Value> = operations
            .iter()
            .map(|operation| operation.payload.clone())
            .collect();

        match self.timed(self.remote.insert_many(target, &records)).await {
            Ok(stored) => {
                if stored.len() != operations.len() {
                    tracing::warn!(
                        "Bulk insert into '{}' returned {} of {} records, inserting the rest individually",
                        target,
                        stored.len(),
                        operations.len()
                    );
                }
                Some(match_bulk_response(operations, stored))
            }
            Err(error) => {
                tracing::warn!(
                    "Bulk insert of {} records into '{}' failed, inserting individually: {}",
                    operations.len(),
                    target,
                    error
                );
                None
            }
        }
    }

    /// Mark an operation as in flight; `None` when it left the queue meanwhile
    async fn claim(&self, operation: &Operation) -> Result<Option<Operation>> {
        match self
            .store
            .update(&operation.id, &OperationPatch::status(OperationStatus::Processing))
            .await
        {
            Ok(claimed) => Ok(Some(claimed)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn record(
        &self,
        operation: Operation,
        result: RemoteResult<Option<Value>>,
    ) -> OperationOutcome {
        match result {
            Ok(response) => {
                let patch = OperationPatch::status(OperationStatus::Completed)
                    .with_synced_at(now_millis())
                    .clear_error();
                let operation = self.persist(operation, &patch).await;
                OperationOutcome::Synced {
                    operation,
                    response,
                }
            }
            Err(error) => {
                let disposition = self.classifier.classify(&error);
                let patch = failure_patch(&operation, disposition, &error);
                let operation = self.persist(operation, &patch).await;
                if disposition == Disposition::Conflict {
                    tracing::warn!("Operation {} conflicted: {}", operation.id, error);
                    OperationOutcome::Conflict { operation, error }
                } else {
                    tracing::warn!(
                        "Operation {} failed (attempt {}/{}): {}",
                        operation.id,
                        operation.retry_count,
                        operation.max_retries,
                        error
                    );
                    OperationOutcome::Failed { operation, error }
                }
            }
        }
    }

    async fn persist(&self, mut operation: Operation, patch: &OperationPatch) -> Operation {
        match self.store.update(&operation.id, patch).await {
            Ok(updated) => updated,
            Err(error) => {
                tracing::warn!("Failed to record outcome of {}: {}", operation.id, error);
                patch.apply_to(&mut operation);
                operation
            }
        }
    }
}

/// Pair a bulk response with the operations that produced it. A complete
/// response is positional; a short one only confirms records it returns by id.
fn match_bulk_response(operations: &[Operation], stored: Vec<Value>) -> Vec<Option<Value>> {
    if stored.len() == operations.len() {
        return stored.into_iter().map(Some).collect();
    }

    let mut by_id: HashMap<String, Value> = stored
        .into_iter()
        .filter_map(|record| entity_id_of(&record).map(|id| (id, record)))
        .collect();
    operations
        .iter()
        .map(|operation| operation.entity_id().and_then(|id| by_id.remove(&id)))
        .collect()
}

fn failure_patch(
    operation: &Operation,
    disposition: Disposition,
    error: &RemoteError,
) -> OperationPatch {
    match disposition {
        Disposition::Conflict => {
            OperationPatch::status(OperationStatus::Pending).with_error(error.to_string())
        }
        Disposition::Retry | Disposition::Fail => {
            let retry_count = operation.retry_count + 1;
            let status = if disposition == Disposition::Fail || retry_count >= operation.max_retries
            {
                OperationStatus::Failed
            } else {
                OperationStatus::Pending
            };
            OperationPatch::status(status)
                .with_retry_count(retry_count)
                .with_error(error.to_string())
        }
    }
}

fn entity_id_for(operation: &Operation) -> RemoteResult<String> {
    operation.entity_id().ok_or_else(|| {
        RemoteError::terminal(format!(
            "{} operation {} has no entity id",
            operation.kind, operation.id
        ))
    })
}
