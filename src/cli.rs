//! CLI struct definitions for the spectrail command-line interface.
//!
//! All clap-derived types live here. Dispatch logic lives in `lib.rs`.

use crate::core::checkpoint::OperationKind;
use crate::core::index::ChangeKind;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "spectrail",
    version = env!("CARGO_PKG_VERSION"),
    about = "Requirement-to-code traceability index and git coordination for cooperating agents."
)]
pub(crate) struct Cli {
    /// Repository root (defaults to discovery from the current directory).
    #[clap(long, short = 'C', global = true)]
    pub dir: Option<PathBuf>,
    /// Output format.
    #[clap(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub format: OutputFormat,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Create the state directory, default config and an empty tag index.
    Init,
    /// Maintain and query the tag index.
    Index(IndexCli),
    /// Check a file's tag linkage against the index. Exits 2 on CRITICAL.
    Validate(ValidateCli),
    /// Manage the git lock.
    Lock(LockCli),
    /// Manage rollback checkpoints.
    Checkpoint(CheckpointCli),
}

#[derive(clap::Args, Debug)]
pub(crate) struct IndexCli {
    #[clap(subcommand)]
    pub command: IndexCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum IndexCommand {
    /// Apply one file-change event.
    Apply {
        #[clap(long)]
        path: PathBuf,
        #[clap(long, value_enum, default_value_t = ChangeKind::Modified)]
        kind: ChangeKind,
    },
    /// Apply `<kind> <path>` lines read from a file, or stdin when omitted.
    Pump {
        #[clap(long)]
        events: Option<PathBuf>,
    },
    /// Re-scan the whole repository and replace the index.
    Rebuild,
    /// Show the entry for one spec_id.
    Query { spec_id: String },
    /// Summary counts per category and lifecycle state.
    Stats,
}

#[derive(clap::Args, Debug)]
pub(crate) struct ValidateCli {
    /// Repo-relative path the content belongs to.
    pub path: PathBuf,
    /// Validate this file's content instead of the file at `path`.
    #[clap(long)]
    pub content_file: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub(crate) struct LockCli {
    #[clap(subcommand)]
    pub command: LockCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum LockCommand {
    /// Take the lock and leave it held; prints the lock_id needed to release.
    Acquire {
        #[clap(long)]
        holder: String,
        #[clap(long)]
        operation: String,
        #[clap(long, default_value = "")]
        description: String,
        /// Wait (bounded by lock.timeout_ms) instead of failing on contention.
        #[clap(long)]
        wait: bool,
        /// Process whose liveness keeps the lock valid (defaults to the parent shell).
        #[clap(long)]
        pid: Option<u32>,
    },
    /// Release a lock taken with `acquire`.
    Release {
        #[clap(long)]
        holder: String,
        #[clap(long)]
        lock_id: String,
    },
    /// Show the current lock record.
    Status,
}

#[derive(clap::Args, Debug)]
pub(crate) struct CheckpointCli {
    #[clap(subcommand)]
    pub command: CheckpointCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CheckpointCommand {
    /// List live checkpoints, newest first.
    List,
    /// Classify an operation without touching git.
    Evaluate {
        #[clap(flatten)]
        op: OperationArgs,
    },
    /// Checkpoint if the operation is risky. With `--lock-id` this runs under
    /// the caller's held lock and leaves it held; otherwise the lock is taken
    /// and released around the check.
    Guard {
        #[clap(long)]
        holder: String,
        /// Lock taken earlier with `lock acquire` by the same holder.
        #[clap(long)]
        lock_id: Option<String>,
        #[clap(long)]
        wait: bool,
        #[clap(flatten)]
        op: OperationArgs,
    },
    /// Restore a checkpoint (a safety checkpoint is taken first).
    Restore {
        id: String,
        #[clap(long)]
        holder: String,
        #[clap(long)]
        lock_id: Option<String>,
        #[clap(long)]
        wait: bool,
    },
    /// Apply retention and delete orphaned refs.
    Prune {
        #[clap(long)]
        holder: String,
        /// Checkpoints of each kind to keep (defaults to checkpoint.retain).
        #[clap(long)]
        keep: Option<usize>,
        #[clap(long)]
        lock_id: Option<String>,
        #[clap(long)]
        wait: bool,
    },
    /// List checkpoint refs with no log entry.
    Orphans,
}

#[derive(clap::Args, Debug)]
pub(crate) struct OperationArgs {
    #[clap(long, value_enum)]
    pub kind: OperationKind,
    #[clap(long, default_value = "")]
    pub label: String,
    /// Touched path (repeatable).
    #[clap(long = "path")]
    pub paths: Vec<String>,
}
