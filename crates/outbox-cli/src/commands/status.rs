use std::path::Path;

use outbox_core::{OperationStatus, OperationStore};
use serde::Serialize;

use crate::error::CliError;

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub db_path: String,
    pub durable: bool,
    pub capacity: usize,
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub failed: usize,
    /// Synced operations blocked on a conflict decision
    pub awaiting_resolution: usize,
}

pub async fn queue_status(store: &OperationStore, db_path: &Path) -> Result<QueueStatus, CliError> {
    let mut status = QueueStatus {
        db_path: db_path.display().to_string(),
        durable: store.is_durable(),
        capacity: store.capacity(),
        ..QueueStatus::default()
    };

    for (operation_status, count) in store.count_by_status().await? {
        status.total += count;
        match operation_status {
            OperationStatus::Pending => status.pending = count,
            OperationStatus::Processing => status.processing = count,
            OperationStatus::Failed => status.failed = count,
            OperationStatus::Completed => status.awaiting_resolution = count,
        }
    }
    Ok(status)
}

pub async fn run_status(
    store: &OperationStore,
    db_path: &Path,
    as_json: bool,
) -> Result<(), CliError> {
    let status = queue_status(store, db_path).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let durability = if status.durable { "durable" } else { "in-memory" };
    println!("Queue: {} ({durability})", status.db_path);
    println!("Total: {}/{}", status.total, status.capacity);
    println!("  pending     {}", status.pending);
    println!("  processing  {}", status.processing);
    println!("  failed      {}", status.failed);
    println!("  conflicted  {}", status.awaiting_resolution);
    Ok(())
}
