//! Non-persistent operation storage

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::OperationStorage;
use crate::error::Result;
use crate::models::{Operation, OperationId, OperationStatus};

/// In-memory implementation of `OperationStorage`.
///
/// Used when the durable backend is unavailable and in tests.
#[derive(Default)]
pub struct MemoryOperationStorage {
    operations: Mutex<HashMap<OperationId, Operation>>,
}

impl MemoryOperationStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<OperationId, Operation>> {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn sorted(mut operations: Vec<Operation>) -> Vec<Operation> {
        operations.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        operations
    }
}

#[async_trait]
impl OperationStorage for MemoryOperationStorage {
    async fn put(&self, operation: &Operation) -> Result<()> {
        self.lock().insert(operation.id, operation.clone());
        Ok(())
    }

    async fn get(&self, id: &OperationId) -> Result<Option<Operation>> {
        Ok(self.lock().get(id).cloned())
    }

    async fn list_by_status(&self, status: OperationStatus) -> Result<Vec<Operation>> {
        let matching = self
            .lock()
            .values()
            .filter(|operation| operation.status == status)
            .cloned()
            .collect();
        Ok(Self::sorted(matching))
    }

    async fn list_all(&self) -> Result<Vec<Operation>> {
        let all = self.lock().values().cloned().collect();
        Ok(Self::sorted(all))
    }

    async fn delete(&self, id: &OperationId) -> Result<bool> {
        Ok(self.lock().remove(id).is_some())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.lock().len())
    }

    async fn clear(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}
