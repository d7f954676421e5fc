use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] outbox_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid operation id: {0}")]
    InvalidOperationId(String),
    #[error("Payload must be a JSON object: {0}")]
    InvalidPayload(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "Remote service is not configured. Set `remote_url` in the config file or OUTBOX_REMOTE_URL."
    )]
    RemoteNotConfigured,
}
