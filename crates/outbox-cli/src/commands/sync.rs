use outbox_core::{EventKind, OperationId, OperationStore, SyncEvent, SyncProgress};
use serde::Serialize;

use crate::commands::common::{build_engine, parse_object};
use crate::config::Settings;
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct SyncSummary {
    #[serde(flatten)]
    pub progress: SyncProgress,
    pub pending: usize,
    pub failed_operations: usize,
    pub awaiting_resolution: usize,
}

pub async fn run_sync(
    store: OperationStore,
    settings: &Settings,
    as_json: bool,
) -> Result<SyncSummary, CliError> {
    let engine = build_engine(store, settings)?;

    let _failures = engine
        .events()
        .subscribe(EventKind::OperationFailed, |event| {
            if let SyncEvent::OperationFailed { operation, error } = event {
                eprintln!("{} {} on '{}' failed: {error}", operation.id, operation.kind, operation.target);
            }
        });
    let _conflicts = engine
        .events()
        .subscribe(EventKind::ConflictsDetected, |event| {
            if let SyncEvent::ConflictsDetected {
                operation,
                findings,
                suggested_resolution,
            } = event
            {
                eprintln!(
                    "{} conflicts with the remote copy ({} findings, suggested {suggested_resolution})",
                    operation.id,
                    findings.len()
                );
            }
        });

    let progress = engine.sync_all().await;
    let report = engine.shutdown().await?;
    let summary = SyncSummary {
        progress,
        pending: report.pending_operations,
        failed_operations: report.failed_operations,
        awaiting_resolution: report.awaiting_resolution,
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "Synced {}/{} operations ({} failed, {}%)",
            progress.completed, progress.total, progress.failed, progress.percentage
        );
        if summary.pending > 0 || summary.failed_operations > 0 {
            println!(
                "{} pending, {} failed",
                summary.pending, summary.failed_operations
            );
        }
        if summary.awaiting_resolution > 0 {
            println!(
                "{} operations await conflict resolution (see `outbox list --status completed`)",
                summary.awaiting_resolution
            );
        }
    }
    Ok(summary)
}

pub async fn run_resolve(
    store: OperationStore,
    settings: &Settings,
    id: OperationId,
    value: &str,
) -> Result<(), CliError> {
    let chosen = parse_object(value)?;
    let engine = build_engine(store, settings)?;

    engine.resolve_conflict(&id, chosen).await?;
    let progress = engine.sync_all().await;
    engine.shutdown().await?;

    println!("{id}");
    if progress.total > 0 {
        println!(
            "Synced {}/{} operations ({} failed)",
            progress.completed, progress.total, progress.failed
        );
    }
    Ok(())
}
