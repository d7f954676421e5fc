use outbox_core::OperationStore;

use crate::error::CliError;

pub async fn run_clear(store: &OperationStore) -> Result<usize, CliError> {
    let removed = store.count().await?;
    store.clear().await?;
    println!("Removed {removed} operations");
    Ok(removed)
}
