use std::sync::Arc;

use chrono::Utc;
use outbox_core::remote::RemoteService;
use outbox_core::{
    Connectivity, Operation, OperationId, OperationStore, RestRemoteService, SyncEngine,
};
use serde::Serialize;
use serde_json::Value;

use crate::config::Settings;
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct OperationListItem {
    pub id: String,
    pub kind: String,
    pub target: String,
    pub entity_id: Option<String>,
    pub status: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub relative_time: String,
    pub payload: Value,
}

pub async fn open_store(settings: &Settings) -> Result<OperationStore, CliError> {
    if let Some(parent) = settings.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let store = OperationStore::open(&settings.db_path, settings.engine.max_queue_size).await;
    if let Some(warning) = store.take_degraded_warning() {
        eprintln!("Warning: {warning}");
    }
    Ok(store)
}

/// Engine wired to the configured REST service, treated as reachable
pub fn build_engine(store: OperationStore, settings: &Settings) -> Result<SyncEngine, CliError> {
    let url = settings
        .remote_url
        .as_deref()
        .ok_or(CliError::RemoteNotConfigured)?;
    let mut remote = RestRemoteService::new(url).map_err(outbox_core::Error::from)?;
    if let Some(token) = &settings.remote_token {
        remote = remote.with_bearer_token(token);
    }
    let remote: Arc<dyn RemoteService> = Arc::new(remote);

    Ok(SyncEngine::builder(store, remote)
        .with_config(settings.engine.clone())
        .with_connectivity(Connectivity::new(true))
        .build())
}

pub fn parse_operation_id(raw: &str) -> Result<OperationId, CliError> {
    raw.trim()
        .parse::<OperationId>()
        .map_err(|_| CliError::InvalidOperationId(raw.trim().to_string()))
}

pub fn parse_object(raw: &str) -> Result<Value, CliError> {
    let value = serde_json::from_str::<Value>(raw)
        .map_err(|error| CliError::InvalidPayload(error.to_string()))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(CliError::InvalidPayload(format!("got {value}")))
    }
}

pub fn format_operation_lines(operations: &[Operation]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    operations
        .iter()
        .map(|operation| {
            let id = operation.id.to_string();
            let short_id = id.chars().take(13).collect::<String>();
            let subject = operation.entity_id().map_or_else(
                || operation.target.clone(),
                |entity| format!("{}/{}", operation.target, entity),
            );
            let relative_time = format_relative_time(operation.created_at, now_ms);
            let retries = format!("{}/{}", operation.retry_count, operation.max_retries);

            match &operation.last_error {
                Some(error) => format!(
                    "{short_id:<13}  {:<6}  {subject:<30}  {:<10}  {retries:<5}  {relative_time:<10}  {error}",
                    operation.kind.as_str(),
                    operation.status.as_str()
                ),
                None => format!(
                    "{short_id:<13}  {:<6}  {subject:<30}  {:<10}  {retries:<5}  {relative_time}",
                    operation.kind.as_str(),
                    operation.status.as_str()
                ),
            }
        })
        .collect()
}

pub fn operation_to_list_item(operation: &Operation) -> OperationListItem {
    let now_ms = Utc::now().timestamp_millis();
    OperationListItem {
        id: operation.id.to_string(),
        kind: operation.kind.to_string(),
        target: operation.target.clone(),
        entity_id: operation.entity_id(),
        status: operation.status.to_string(),
        retry_count: operation.retry_count,
        max_retries: operation.max_retries,
        last_error: operation.last_error.clone(),
        created_at: operation.created_at,
        relative_time: format_relative_time(operation.created_at, now_ms),
        payload: operation.payload.clone(),
    }
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}
