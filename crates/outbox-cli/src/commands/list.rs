use outbox_core::{OperationStatus, OperationStore};

use crate::commands::common::{format_operation_lines, operation_to_list_item, OperationListItem};
use crate::error::CliError;

pub async fn run_list(
    store: &OperationStore,
    status: Option<OperationStatus>,
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    let mut operations = match status {
        Some(status) => store.list_by_status(status).await?,
        None => store.list_all().await?,
    };
    operations.truncate(limit);

    if as_json {
        let json_items = operations
            .iter()
            .map(operation_to_list_item)
            .collect::<Vec<OperationListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if operations.is_empty() {
        println!("No queued operations.");
        return Ok(());
    }

    for line in format_operation_lines(&operations) {
        println!("{line}");
    }
    Ok(())
}
