use outbox_core::{Operation, OperationId, OperationStatus, OperationStore};

use crate::error::CliError;

pub async fn run_cancel(store: &OperationStore, id: OperationId) -> Result<Operation, CliError> {
    let cancellable = [OperationStatus::Pending, OperationStatus::Failed];
    let Some(operation) = store.remove_if(&id, &cancellable).await? else {
        let error = match store.get(&id).await? {
            Some(operation) => outbox_core::Error::InvalidInput(format!(
                "operation {id} is {} and cannot be cancelled",
                operation.status
            )),
            None => outbox_core::Error::NotFound(id.to_string()),
        };
        return Err(error.into());
    };

    println!("{}", operation.id);
    Ok(operation)
}
