//! Durable operation store.
//!
//! The only component allowed to mutate queued operations. Every write goes
//! through a single writer lock so capacity checks and read-modify-write
//! updates stay atomic under concurrent callers.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Mutex as AsyncMutex;

use crate::db::{Database, LibSqlOperationStorage, MemoryOperationStorage, OperationStorage};
use crate::error::{DurabilityDegraded, Error, Result};
use crate::models::{Operation, OperationId, OperationPatch, OperationStatus};

/// Default capacity of the queue
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

/// Queue of pending operations backed by an injected storage strategy
pub struct OperationStore {
    storage: Arc<dyn OperationStorage>,
    max_size: usize,
    write_lock: AsyncMutex<()>,
    degraded: Mutex<Option<DurabilityDegraded>>,
}

impl OperationStore {
    /// Create a store over the given storage
    pub fn new(storage: Arc<dyn OperationStorage>, max_size: usize) -> Self {
        Self {
            storage,
            max_size,
            write_lock: AsyncMutex::new(()),
            degraded: Mutex::new(None),
        }
    }

    /// Open a durable store at `path`, falling back to memory when the
    /// database cannot be opened.
    ///
    /// The fallback is reported once through [`Self::take_degraded_warning`].
    pub async fn open(path: impl AsRef<Path>, max_size: usize) -> Self {
        let path = path.as_ref();
        match Database::open(path).await {
            Ok(db) => Self::new(Arc::new(LibSqlOperationStorage::new(db)), max_size),
            Err(error) => {
                tracing::warn!(
                    "Durable operation queue unavailable at {}: {}. Falling back to in-memory queue.",
                    path.display(),
                    error
                );
                let store = Self::new(Arc::new(MemoryOperationStorage::new()), max_size);
                *store.degraded_slot() = Some(DurabilityDegraded {
                    reason: error.to_string(),
                });
                store
            }
        }
    }

    /// Open a non-persistent store (primarily for tests)
    pub fn in_memory(max_size: usize) -> Self {
        Self::new(Arc::new(MemoryOperationStorage::new()), max_size)
    }

    fn degraded_slot(&self) -> std::sync::MutexGuard<'_, Option<DurabilityDegraded>> {
        self.degraded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the degraded-durability warning; yields it at most once
    pub fn take_degraded_warning(&self) -> Option<DurabilityDegraded> {
        self.degraded_slot().take()
    }

    /// Whether queued operations survive a restart
    pub fn is_durable(&self) -> bool {
        self.storage.is_durable()
    }

    pub const fn capacity(&self) -> usize {
        self.max_size
    }

    /// Add an operation to the queue
    pub async fn enqueue(&self, operation: Operation) -> Result<OperationId> {
        operation.validate()?;

        let _guard = self.write_lock.lock().await;
        if self.storage.count().await? >= self.max_size {
            tracing::warn!(
                "Rejected {} on '{}': queue is full ({} operations)",
                operation.kind,
                operation.target,
                self.max_size
            );
            return Err(Error::QueueFull {
                capacity: self.max_size,
            });
        }

        self.storage.put(&operation).await?;
        tracing::debug!(
            "Queued {} operation {} on '{}'",
            operation.kind,
            operation.id,
            operation.target
        );
        Ok(operation.id)
    }

    /// Get an operation by ID
    pub async fn get(&self, id: &OperationId) -> Result<Option<Operation>> {
        self.storage.get(id).await
    }

    /// List operations with the given status, oldest first
    pub async fn list_by_status(&self, status: OperationStatus) -> Result<Vec<Operation>> {
        self.storage.list_by_status(status).await
    }

    /// List all operations, oldest first
    pub async fn list_all(&self) -> Result<Vec<Operation>> {
        self.storage.list_all().await
    }

    /// Apply a partial update, returning the updated operation
    pub async fn update(&self, id: &OperationId, patch: &OperationPatch) -> Result<Operation> {
        let _guard = self.write_lock.lock().await;
        let mut operation = self
            .storage
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        patch.apply_to(&mut operation);
        self.storage.put(&operation).await?;
        Ok(operation)
    }

    /// Remove an operation, returning whether it existed
    pub async fn remove(&self, id: &OperationId) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        self.storage.delete(id).await
    }

    /// Remove an operation only while it is still in one of `statuses`
    pub async fn remove_if(
        &self,
        id: &OperationId,
        statuses: &[OperationStatus],
    ) -> Result<Option<Operation>> {
        let _guard = self.write_lock.lock().await;
        let Some(operation) = self.storage.get(id).await? else {
            return Ok(None);
        };
        if !statuses.contains(&operation.status) {
            return Ok(None);
        }
        self.storage.delete(id).await?;
        Ok(Some(operation))
    }

    /// Number of queued operations
    pub async fn count(&self) -> Result<usize> {
        self.storage.count().await
    }

    /// Count operations per status, in `OperationStatus::ALL` order
    pub async fn count_by_status(&self) -> Result<Vec<(OperationStatus, usize)>> {
        let all = self.storage.list_all().await?;
        Ok(OperationStatus::ALL
            .iter()
            .map(|status| {
                (
                    *status,
                    all.iter().filter(|op| op.status == *status).count(),
                )
            })
            .collect())
    }

    /// Move a failed operation back to pending with a fresh retry budget
    pub async fn reset_failed(&self, id: &OperationId) -> Result<Operation> {
        let _guard = self.write_lock.lock().await;
        let mut operation = self
            .storage
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if operation.status != OperationStatus::Failed {
            return Err(Error::InvalidInput(format!(
                "operation {id} is {}, only failed operations can be retried",
                operation.status
            )));
        }
        retry_patch().apply_to(&mut operation);
        self.storage.put(&operation).await?;
        Ok(operation)
    }

    /// [`Self::reset_failed`] for every failed operation, oldest first
    pub async fn reset_all_failed(&self) -> Result<Vec<Operation>> {
        let _guard = self.write_lock.lock().await;
        let mut failed = self.storage.list_by_status(OperationStatus::Failed).await?;
        for operation in &mut failed {
            retry_patch().apply_to(operation);
            self.storage.put(operation).await?;
        }
        Ok(failed)
    }

    /// Remove every operation
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.storage.clear().await
    }
}

fn retry_patch() -> OperationPatch {
    OperationPatch::status(OperationStatus::Pending)
        .with_retry_count(0)
        .clear_error()
}
