use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use outbox_core::{OperationKind, OperationStatus};

#[derive(Parser)]
#[command(name = "outbox")]
#[command(about = "Queue and sync offline operations from the command line")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local queue database
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional path to the JSON config file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Queue an operation for the next sync
    #[command(alias = "add")]
    Enqueue {
        /// Operation kind
        #[arg(value_enum)]
        kind: KindArg,
        /// Target table or collection
        target: String,
        /// Record payload as a JSON object
        payload: String,
    },
    /// List queued operations
    List {
        /// Only show operations with this status
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
        /// Number of operations to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show queue counts per status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Reset failed operations so the next sync attempts them again
    Retry {
        /// Operation ID (all failed operations when omitted)
        id: Option<String>,
    },
    /// Remove a pending or failed operation
    Cancel {
        /// Operation ID
        id: String,
    },
    /// Remove every queued operation
    Clear,
    /// Push queued operations to the remote service
    Sync {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Settle an operation blocked on a conflict
    Resolve {
        /// Operation ID
        id: String,
        /// Chosen record value as a JSON object
        value: String,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KindArg {
    Create,
    Update,
    Delete,
}

impl From<KindArg> for OperationKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Create => Self::Create,
            KindArg::Update => Self::Update,
            KindArg::Delete => Self::Delete,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum StatusArg {
    Pending,
    Processing,
    Failed,
    /// Synced but blocked on a conflict decision
    Completed,
}

impl From<StatusArg> for OperationStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Pending => Self::Pending,
            StatusArg::Processing => Self::Processing,
            StatusArg::Failed => Self::Failed,
            StatusArg::Completed => Self::Completed,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
