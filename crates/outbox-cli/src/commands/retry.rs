use outbox_core::{Operation, OperationId, OperationStore};

use crate::error::CliError;

/// Reset one failed operation, or every failed operation when `id` is `None`
pub async fn run_retry(
    store: &OperationStore,
    id: Option<OperationId>,
) -> Result<Vec<Operation>, CliError> {
    let retried = match id {
        Some(id) => vec![store.reset_failed(&id).await?],
        None => store.reset_all_failed().await?,
    };

    if retried.is_empty() {
        println!("No failed operations.");
    } else {
        for operation in &retried {
            println!("{}", operation.id);
        }
    }
    Ok(retried)
}
