use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpectrailError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config error in {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },
    #[error("Invalid glob pattern: {0}")]
    GlobError(#[from] globset::Error),
    #[error("Tag index corrupt: {0}")]
    SchemaCorruption(String),
    #[error(
        "LOCK_CONTENTION: git lock held by '{holder_id}' (operation={operation}, pid={process_id}): {description}"
    )]
    LockContention {
        holder_id: String,
        operation: String,
        description: String,
        process_id: u32,
    },
    #[error("LOCK_TIMEOUT: gave up after {waited_ms}ms waiting on '{holder_id}' ({operation})")]
    LockTimeout {
        waited_ms: u64,
        holder_id: String,
        operation: String,
    },
    #[error("LOCK_NOT_HELD: '{0}' does not hold the current git lock")]
    NotLockHolder(String),
    #[error("git {args} failed ({context}): {stderr}")]
    GitOperationFailure {
        context: String,
        args: String,
        stderr: String,
    },
    #[error("RESTORE_CONFLICT: checkpoint {checkpoint_id} cannot be restored cleanly: {}", .paths.join(", "))]
    RestoreConflict {
        checkpoint_id: String,
        paths: Vec<String>,
    },
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
}
