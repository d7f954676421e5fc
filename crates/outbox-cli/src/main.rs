//! Outbox CLI - inspect and drain the offline operation queue
//!
//! Queue operations locally and push them to the remote service once it is
//! reachable.

mod cli;
mod commands;
mod config;
mod error;


use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::cancel::run_cancel;
use crate::commands::clear::run_clear;
use crate::commands::common::{open_store, parse_operation_id};
use crate::commands::completions::run_completions;
use crate::commands::enqueue::run_enqueue;
use crate::commands::list::run_list;
use crate::commands::retry::run_retry;
use crate::commands::status::run_status;
use crate::commands::sync::{run_resolve, run_sync};
use crate::config::resolve_settings;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let directive = "outbox=info"
        .parse::<tracing_subscriber::filter::Directive>()
        .map_err(|error| CliError::Config(format!("invalid log directive: {error}")))?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Commands::Completions { shell, output } = &cli.command {
        return run_completions(*shell, output.as_deref());
    }

    let settings = resolve_settings(cli.db_path, cli.config)?;
    let store = open_store(&settings).await?;

    match cli.command {
        Commands::Enqueue {
            kind,
            target,
            payload,
        } => {
            run_enqueue(&store, &settings, kind.into(), &target, &payload).await?;
        }
        Commands::List {
            status,
            limit,
            json,
        } => run_list(&store, status.map(Into::into), limit, json).await?,
        Commands::Status { json } => run_status(&store, &settings.db_path, json).await?,
        Commands::Retry { id } => {
            let id = id.as_deref().map(parse_operation_id).transpose()?;
            run_retry(&store, id).await?;
        }
        Commands::Cancel { id } => {
            run_cancel(&store, parse_operation_id(&id)?).await?;
        }
        Commands::Clear => {
            run_clear(&store).await?;
        }
        Commands::Sync { json } => {
            run_sync(store, &settings, json).await?;
        }
        Commands::Resolve { id, value } => {
            run_resolve(store, &settings, parse_operation_id(&id)?, &value).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
