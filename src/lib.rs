//! Spectrail: traceability and git-safety coordination for cooperating agents.
//!
//! Two halves share one state directory (`.spectrail/`) under the repository
//! root:
//!
//! - **Tag index**: comment markers such as `// @REQ AUTH-001` are parsed out
//!   of source files ([`core::tags`]) and kept in a categorized, schema-checked
//!   document ([`core::index`]). [`plugins::policy`] uses that document to
//!   decide whether an edit carries the tags it needs.
//! - **Git coordination**: a file lock ([`core::git_lock`]) serializes every
//!   git-mutating sequence, and [`core::checkpoint`] snapshots the repository
//!   into `refs/spectrail/checkpoints/*` before risky operations.
//!
//! # Example
//!
//! ```bash
//! spectrail init
//! spectrail index rebuild
//! spectrail validate src/auth.rs
//! spectrail checkpoint guard --holder agent-a --kind delete --path a.rs --path b.rs
//!
//! # hold the lock across your own git mutation
//! spectrail lock acquire --holder agent-a --operation delete   # prints lock_id
//! spectrail checkpoint guard --holder agent-a --lock-id "$ID" --kind delete --path a.rs
//! git rm a.rs && git commit -m "drop a"
//! spectrail lock release --holder agent-a --lock-id "$ID"
//! ```
//!
//! Diagnostics go through `tracing`; set `SPECTRAIL_LOG=debug` to see them.

mod cli;
pub mod core;
pub mod plugins;

pub use crate::core::error::SpectrailError;

use crate::cli::{
    CheckpointCommand, Cli, Command, IndexCommand, LockCommand, OperationArgs, OutputFormat,
};
use crate::core::checkpoint::{CheckpointCoordinator, GitOperation};
use crate::core::config::SpectrailConfig;
use crate::core::git_lock::{GitLockGuard, GitLockManager, LockState};
use crate::core::index::IndexManager;
use crate::core::tags::Category;
use crate::core::time;
use crate::core::workspace::Workspace;
use crate::plugins::{policy, watcher};
use clap::Parser;
use colored::Colorize;
use serde_json::json;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Exit code for a validation with blocking violations.
pub const EXIT_BLOCKED: i32 = 2;

struct Repo {
    cwd: PathBuf,
    workspace: Workspace,
    config: SpectrailConfig,
}

impl Repo {
    fn open(dir: Option<&Path>) -> Result<Self, SpectrailError> {
        let cwd = std::env::current_dir()?;
        let workspace = match dir {
            Some(dir) => Workspace::new(cwd.join(dir)),
            None => Workspace::discover(&cwd).unwrap_or_else(|_| Workspace::new(&cwd)),
        };
        let config = SpectrailConfig::load(&workspace)?;
        Ok(Self {
            cwd,
            workspace,
            config,
        })
    }

    fn index(&self) -> IndexManager {
        IndexManager::new(&self.workspace, &self.config)
    }

    fn locks(&self) -> GitLockManager {
        GitLockManager::new(&self.workspace, &self.config.lock)
    }

    fn checkpoints(&self) -> Result<CheckpointCoordinator, SpectrailError> {
        CheckpointCoordinator::new(&self.workspace, &self.config.checkpoint)
    }

    fn from_cwd(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }
}

fn emit(
    format: OutputFormat,
    cmd: &str,
    status: &str,
    payload: serde_json::Value,
    text: impl FnOnce(),
) -> Result<(), SpectrailError> {
    match format {
        OutputFormat::Json => {
            let envelope = time::command_envelope(cmd, status, payload);
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
        OutputFormat::Text => text(),
    }
    Ok(())
}

/// Install the stderr subscriber; `SPECTRAIL_LOG` overrides the `warn` default.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("SPECTRAIL_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Parse arguments and dispatch. Returns the process exit code.
pub fn run() -> Result<i32, SpectrailError> {
    let cli = Cli::parse();
    let repo = Repo::open(cli.dir.as_deref())?;
    let format = cli.format;

    match cli.command {
        Command::Init => run_init(&repo, format).map(|_| 0),
        Command::Index(index) => run_index(&repo, format, index.command).map(|_| 0),
        Command::Validate(args) => run_validate(&repo, format, &args.path, args.content_file),
        Command::Lock(lock) => run_lock(&repo, format, lock.command).map(|_| 0),
        Command::Checkpoint(cp) => run_checkpoint(&repo, format, cp.command).map(|_| 0),
    }
}

fn run_init(repo: &Repo, format: OutputFormat) -> Result<(), SpectrailError> {
    repo.workspace.ensure_state_dir()?;
    let wrote_config = SpectrailConfig::write_default(&repo.workspace)?;
    let wrote_index = repo.index().initialize()?;
    let state_dir = repo.workspace.state_dir.display().to_string();
    emit(
        format,
        "init",
        "ok",
        json!({"state_dir": state_dir, "config_created": wrote_config, "index_created": wrote_index}),
        || {
            println!("{} {}", "initialized".green().bold(), state_dir);
            if !wrote_config && !wrote_index {
                println!("  (already initialized; nothing overwritten)");
            }
        },
    )
}

fn run_index(repo: &Repo, format: OutputFormat, cmd: IndexCommand) -> Result<(), SpectrailError> {
    let manager = repo.index();
    match cmd {
        IndexCommand::Apply { path, kind } => {
            let outcome = manager.process_change(&repo.from_cwd(&path), kind)?;
            emit(format, "index.apply", "ok", json!({"outcome": outcome}), || {
                println!(
                    "{} {} ({} -> {} tags, total {}){}",
                    "indexed".green(),
                    outcome.path,
                    outcome.occurrences_before,
                    outcome.occurrences_after,
                    outcome.total_tags,
                    if outcome.written { "" } else { " unchanged" }
                );
            })
        }
        IndexCommand::Pump { events } => {
            let input = match events {
                Some(file) => std::fs::read_to_string(repo.from_cwd(&file))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let events = watcher::parse_event_lines(&input)?;
            let report = watcher::pump(&manager, events);
            let status = if report.failed.is_empty() { "ok" } else { "partial" };
            emit(format, "index.pump", status, json!({"report": report}), || {
                println!(
                    "{} {} events, {} written, {} failed",
                    "pumped".green(),
                    report.applied.len(),
                    report.written(),
                    report.failed.len()
                );
                for failure in &report.failed {
                    println!("  {} {}: {}", "x".red(), failure.path.display(), failure.error);
                }
            })
        }
        IndexCommand::Rebuild => {
            let doc = manager.rebuild_workspace()?;
            emit(
                format,
                "index.rebuild",
                "ok",
                json!({"total_tags": doc.metadata.total_tags, "files": doc.files.len()}),
                || {
                    println!(
                        "{} {} tags across {} files",
                        "rebuilt".green().bold(),
                        doc.metadata.total_tags,
                        doc.files.len()
                    );
                },
            )
        }
        IndexCommand::Query { spec_id } => {
            let doc = manager.load();
            let Some(record) = doc.query(&spec_id) else {
                return Err(SpectrailError::NotFound(format!("spec_id {spec_id}")));
            };
            emit(format, "index.query", "ok", json!({"record": record}), || {
                println!(
                    "{} [{} / {}]",
                    record.spec_id.bold(),
                    record.category.as_str(),
                    record.directive
                );
                if let Some(desc) = &record.entry.description {
                    println!("  {desc}");
                }
                for loc in &record.entry.locations {
                    println!("  {}:{} {}", loc.file, loc.line, loc.verb);
                }
            })
        }
        IndexCommand::Stats => {
            let state = manager.state();
            let schema = match manager.load_strict() {
                Ok(_) => "valid".to_string(),
                Err(SpectrailError::IoError(_)) => "missing".to_string(),
                Err(err) => err.to_string(),
            };
            let doc = manager.load();
            let per_category: serde_json::Map<String, serde_json::Value> = Category::ALL
                .into_iter()
                .map(|c| {
                    let n: usize = doc.categories.get(c).values().map(|b| b.len()).sum();
                    (c.as_str().to_string(), json!(n))
                })
                .collect();
            emit(
                format,
                "index.stats",
                "ok",
                json!({
                    "state": state,
                    "schema": schema,
                    "total_tags": doc.metadata.total_tags,
                    "files": doc.files.len(),
                    "chains": doc.chains.len(),
                    "categories": per_category,
                }),
                || {
                    println!("state:      {state:?}");
                    println!("schema:     {schema}");
                    println!("total_tags: {}", doc.metadata.total_tags);
                    println!("files:      {}", doc.files.len());
                    println!("chains:     {}", doc.chains.len());
                    for (category, n) in &per_category {
                        println!("  {category:<15} {n}");
                    }
                },
            )
        }
    }
}

fn run_validate(
    repo: &Repo,
    format: OutputFormat,
    path: &Path,
    content_file: Option<PathBuf>,
) -> Result<i32, SpectrailError> {
    let abs = repo.from_cwd(path);
    let rel = repo.workspace.contained(&abs)?;
    let content = match content_file {
        Some(f) => std::fs::read_to_string(repo.from_cwd(&f))?,
        None => std::fs::read_to_string(&abs)?,
    };
    let validator = policy::PolicyValidator::new(&repo.config.policy, repo.index().load())?;
    let violations = validator.validate(&rel, &content);
    let blocked = policy::blocking(&violations);
    let status = if blocked { "blocked" } else { "ok" };
    emit(
        format,
        "validate",
        status,
        json!({"path": rel, "violations": violations}),
        || {
            if violations.is_empty() {
                println!("{} {}", "ok".green().bold(), rel);
            }
            for v in &violations {
                let sev = match v.severity {
                    policy::Severity::Critical => v.severity.to_string().red().bold(),
                    policy::Severity::High => v.severity.to_string().red(),
                    policy::Severity::Medium => v.severity.to_string().yellow(),
                    policy::Severity::Low => v.severity.to_string().normal(),
                };
                let at = v.line.map(|l| format!(":{l}")).unwrap_or_default();
                println!("{sev} {} {}{at}: {}", v.rule, v.file, v.message);
            }
        },
    )?;
    Ok(if blocked { EXIT_BLOCKED } else { 0 })
}

fn run_lock(repo: &Repo, format: OutputFormat, cmd: LockCommand) -> Result<(), SpectrailError> {
    match cmd {
        LockCommand::Acquire {
            holder,
            operation,
            description,
            wait,
            pid,
        } => {
            let locks = repo.locks().with_owner_pid(pid.unwrap_or_else(default_owner_pid));
            let record = locks
                .acquire(&holder, &operation, &description, wait)?
                .detach();
            emit(format, "lock.acquire", "ok", json!({"record": record}), || {
                println!("{} lock_id={}", "acquired".green().bold(), record.lock_id);
            })
        }
        LockCommand::Release { holder, lock_id } => {
            repo.locks().release_record(&holder, &lock_id)?;
            emit(format, "lock.release", "ok", json!({"holder_id": holder}), || {
                println!("{} {}", "released".green(), holder);
            })
        }
        LockCommand::Status => {
            let state = repo.locks().status();
            emit(format, "lock.status", "ok", json!({"lock": state}), || match &state {
                LockState::Free => println!("{}", "free".green()),
                LockState::Held { record } => println!(
                    "{} by {} (operation={}, pid={}): {}",
                    "held".yellow().bold(),
                    record.holder_id,
                    record.operation,
                    record.process_id,
                    record.description
                ),
                LockState::Stale { record } => println!(
                    "{} {}",
                    "stale".red(),
                    record
                        .as_ref()
                        .map(|r| r.holder_id.as_str())
                        .unwrap_or("<unreadable record>")
                ),
                LockState::Settling => println!("{}", "being written".yellow()),
            })
        }
    }
}

fn operation(args: OperationArgs) -> GitOperation {
    GitOperation::new(args.kind, args.label, args.paths)
}

/// Run `f` under the caller's held lock (`lock_id`), leaving it held, or
/// under one acquired for this call and released afterwards.
fn under_lock<T>(
    locks: &GitLockManager,
    holder: &str,
    lock_id: Option<&str>,
    (operation, description): (&str, &str),
    wait: bool,
    f: impl FnOnce(&GitLockGuard<'_>) -> Result<T, SpectrailError>,
) -> Result<T, SpectrailError> {
    if let Some(lock_id) = lock_id {
        let lock = locks.adopt(holder, lock_id)?;
        return f(&lock);
    }
    let lock = locks.acquire(holder, operation, description, wait)?;
    let result = f(&lock);
    let released = lock.release();
    let value = result?;
    released?;
    Ok(value)
}

fn run_checkpoint(
    repo: &Repo,
    format: OutputFormat,
    cmd: CheckpointCommand,
) -> Result<(), SpectrailError> {
    let coordinator = repo.checkpoints()?;
    match cmd {
        CheckpointCommand::List => {
            let list = coordinator.list();
            emit(format, "checkpoint.list", "ok", json!({"checkpoints": list}), || {
                if list.is_empty() {
                    println!("no checkpoints");
                }
                for cp in &list {
                    let tag = if cp.is_safety { "safety" } else { "guard" };
                    println!(
                        "{} {} {} {} ({})",
                        cp.id.bold(),
                        tag.cyan(),
                        &cp.commit[..cp.commit.len().min(12)],
                        cp.label,
                        cp.reason
                    );
                }
            })
        }
        CheckpointCommand::Evaluate { op } => {
            let op = operation(op);
            let risk = coordinator.evaluate(&op);
            let status = if risk.is_some() { "risky" } else { "safe" };
            emit(format, "checkpoint.evaluate", status, json!({"risk": risk}), || {
                match &risk {
                    Some(reason) => println!("{} {reason}", "risky".yellow().bold()),
                    None => println!("{}", "safe".green()),
                }
            })
        }
        CheckpointCommand::Guard {
            holder,
            lock_id,
            wait,
            op,
        } => {
            let op = operation(op);
            let locks = repo.locks();
            let checkpoint = under_lock(
                &locks,
                &holder,
                lock_id.as_deref(),
                (op.kind.as_str(), &op.label),
                wait,
                |lock| coordinator.guard(lock, &op),
            )?;
            emit(
                format,
                "checkpoint.guard",
                "ok",
                json!({"checkpoint": checkpoint}),
                || match &checkpoint {
                    Some(cp) => println!("{} {} ({})", "checkpoint".green().bold(), cp.id, cp.reason),
                    None => println!("{}", "no checkpoint needed".green()),
                },
            )
        }
        CheckpointCommand::Restore {
            id,
            holder,
            lock_id,
            wait,
        } => {
            let locks = repo.locks();
            let safety = under_lock(
                &locks,
                &holder,
                lock_id.as_deref(),
                ("restore", &format!("restore {id}")),
                wait,
                |lock| coordinator.restore(lock, &id),
            )?;
            emit(
                format,
                "checkpoint.restore",
                "ok",
                json!({"restored": id, "safety": safety}),
                || {
                    println!(
                        "{} {} (safety checkpoint {})",
                        "restored".green().bold(),
                        id,
                        safety.id
                    );
                },
            )
        }
        CheckpointCommand::Prune {
            holder,
            keep,
            lock_id,
            wait,
        } => {
            let keep = keep.unwrap_or(coordinator.retain());
            let locks = repo.locks();
            let report = under_lock(
                &locks,
                &holder,
                lock_id.as_deref(),
                ("prune", "checkpoint retention"),
                wait,
                |lock| coordinator.prune(lock, keep),
            )?;
            emit(format, "checkpoint.prune", "ok", json!({"report": report}), || {
                println!(
                    "{} {} checkpoints, {} orphaned refs",
                    "pruned".green(),
                    report.pruned.len(),
                    report.orphans_removed.len()
                );
            })
        }
        CheckpointCommand::Orphans => {
            let orphans = coordinator.orphans()?;
            emit(format, "checkpoint.orphans", "ok", json!({"orphans": orphans}), || {
                for r in &orphans {
                    println!("{r}");
                }
            })
        }
    }
}

#[cfg(unix)]
fn default_owner_pid() -> u32 {
    std::os::unix::process::parent_id()
}

#[cfg(not(unix))]
fn default_owner_pid() -> u32 {
    std::process::id()
}
