use outbox_core::{Operation, OperationKind, OperationStore};

use crate::commands::common::parse_object;
use crate::config::Settings;
use crate::error::CliError;

pub async fn run_enqueue(
    store: &OperationStore,
    settings: &Settings,
    kind: OperationKind,
    target: &str,
    payload: &str,
) -> Result<Operation, CliError> {
    let payload = parse_object(payload)?;
    let operation = Operation::new(kind, target.trim(), payload)
        .with_max_retries(settings.engine.max_retries);
    operation.validate()?;

    store.enqueue(operation.clone()).await?;
    tracing::debug!("Queued {} on '{}'", operation.kind, operation.target);
    println!("{}", operation.id);
    Ok(operation)
}
