//! Rollback points around risky git mutations.
//!
//! A checkpoint is a ref `refs/spectrail/checkpoints/<id>` pointing at a
//! snapshot commit, plus one `created` line in `.spectrail/checkpoints.jsonl`.
//! The log is append-only: retention appends `pruned` lines rather than
//! rewriting history. The ref is created before its log line, so a crash in
//! between leaves an orphaned ref that `orphans()` reports and `prune` removes.
//!
//! Everything that writes refs takes a `&GitLockGuard`.

use crate::core::audit::AuditLog;
use crate::core::config::CheckpointConfig;
use crate::core::error::SpectrailError;
use crate::core::git::{self, GitRepo};
use crate::core::git_lock::{GitLockGuard, GitLockManager};
use crate::core::time;
use crate::core::workspace::{CHECKPOINT_REF_PREFIX, Workspace};
use clap::ValueEnum;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Commit,
    Merge,
    Rebase,
    Reset,
    Checkout,
    Delete,
    #[value(alias = "move")]
    Rename,
    Other,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Commit => "commit",
            OperationKind::Merge => "merge",
            OperationKind::Rebase => "rebase",
            OperationKind::Reset => "reset",
            OperationKind::Checkout => "checkout",
            OperationKind::Delete => "delete",
            OperationKind::Rename => "rename",
            OperationKind::Other => "other",
        }
    }
}

/// A git-mutating operation about to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitOperation {
    pub kind: OperationKind,
    pub label: String,
    /// Repo-relative paths the operation touches.
    pub paths: Vec<String>,
}

impl GitOperation {
    pub fn new(kind: OperationKind, label: impl Into<String>, paths: Vec<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            paths,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RiskReason {
    MassDelete { count: usize, threshold: usize },
    MassRename { count: usize, threshold: usize },
    CriticalFile { path: String },
}

impl fmt::Display for RiskReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskReason::MassDelete { count, threshold } => {
                write!(f, "deletes {count} paths (threshold {threshold})")
            }
            RiskReason::MassRename { count, threshold } => {
                write!(f, "renames {count} paths (threshold {threshold})")
            }
            RiskReason::CriticalFile { path } => write!(f, "touches critical file {path}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub commit: String,
    pub operation_type: OperationKind,
    pub label: String,
    pub reason: String,
    pub is_safety: bool,
    /// Epoch milliseconds.
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum LogEntry {
    Created(Checkpoint),
    Pruned { id: String, pruned_at: u64 },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub pruned: Vec<String>,
    pub orphans_removed: Vec<String>,
}

pub struct CheckpointCoordinator {
    git: GitRepo,
    config: CheckpointConfig,
    critical: GlobSet,
    log_path: PathBuf,
    audit: AuditLog,
}

impl CheckpointCoordinator {
    pub fn new(workspace: &Workspace, config: &CheckpointConfig) -> Result<Self, SpectrailError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.critical_files {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            git: GitRepo::new(&workspace.root),
            config: config.clone(),
            critical: builder.build()?,
            log_path: workspace.checkpoint_log_path(),
            audit: AuditLog::new(workspace),
        })
    }

    /// Risk classification; first matching predicate wins. No I/O.
    pub fn evaluate(&self, op: &GitOperation) -> Option<RiskReason> {
        let count = op.paths.len();
        if op.kind == OperationKind::Delete && count > self.config.delete_threshold {
            return Some(RiskReason::MassDelete {
                count,
                threshold: self.config.delete_threshold,
            });
        }
        if op.kind == OperationKind::Rename && count > self.config.rename_threshold {
            return Some(RiskReason::MassRename {
                count,
                threshold: self.config.rename_threshold,
            });
        }
        op.paths
            .iter()
            .find(|p| self.critical.is_match(p.as_str()))
            .map(|p| RiskReason::CriticalFile { path: p.clone() })
    }

    /// Snapshot before `op` if it is risky. Safe operations make no git calls.
    pub fn guard(
        &self,
        lock: &GitLockGuard<'_>,
        op: &GitOperation,
    ) -> Result<Option<Checkpoint>, SpectrailError> {
        let Some(reason) = self.evaluate(op) else {
            return Ok(None);
        };
        self.create(lock, op.kind, &op.label, &reason.to_string(), false)
            .map(Some)
    }

    /// Acquire the lock, checkpoint if risky, run `f`, release the lock.
    ///
    /// The lock is released whether `f` succeeds or fails; `f`'s error wins
    /// over a release error.
    pub fn run_guarded<T>(
        &self,
        locks: &GitLockManager,
        holder_id: &str,
        op: &GitOperation,
        wait: bool,
        f: impl FnOnce(Option<&Checkpoint>) -> Result<T, SpectrailError>,
    ) -> Result<(Option<Checkpoint>, T), SpectrailError> {
        let lock = locks.acquire(holder_id, op.kind.as_str(), &op.label, wait)?;
        let checkpoint = match self.guard(&lock, op) {
            Ok(cp) => cp,
            Err(err) => {
                let _ = lock.release();
                return Err(err);
            }
        };
        let result = f(checkpoint.as_ref());
        let released = lock.release();
        let value = result?;
        released?;
        Ok((checkpoint, value))
    }

    /// Return the working tree to a checkpoint. A safety checkpoint of the
    /// current state is always taken first and returned.
    pub fn restore(
        &self,
        lock: &GitLockGuard<'_>,
        checkpoint_id: &str,
    ) -> Result<Checkpoint, SpectrailError> {
        let target = self
            .list()
            .into_iter()
            .find(|cp| cp.id == checkpoint_id)
            .ok_or_else(|| SpectrailError::NotFound(format!("checkpoint {checkpoint_id}")))?;
        let Some(commit) = self.git.resolve(&target.git_ref)? else {
            return Err(SpectrailError::RestoreConflict {
                checkpoint_id: checkpoint_id.to_string(),
                paths: Vec::new(),
            });
        };

        let safety = self.create(
            lock,
            OperationKind::Checkout,
            &format!("before restore of {checkpoint_id}"),
            "restore",
            true,
        )?;

        // Tracked edits are held by the safety snapshot and may be discarded;
        // untracked files the target would overwrite are not.
        let untracked = self.git.untracked_paths()?;
        if !untracked.is_empty() {
            let tracked = self.git.tree_paths(&commit)?;
            let blocked: Vec<String> = untracked
                .into_iter()
                .filter(|p| tracked.contains(p))
                .collect();
            if !blocked.is_empty() {
                return Err(self.restore_conflict(lock, checkpoint_id, &safety, blocked));
            }
        }

        let output = self.git.output(&["checkout", "--detach", "--force", &commit])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(match git::overwritten_paths(&stderr) {
                Some(paths) => self.restore_conflict(lock, checkpoint_id, &safety, paths),
                None => SpectrailError::GitOperationFailure {
                    context: "restore checkpoint".to_string(),
                    args: format!("checkout --detach --force {commit}"),
                    stderr: stderr.trim().to_string(),
                },
            });
        }
        self.audit.record(
            lock.holder_id(),
            "checkpoint.restore",
            "ok",
            serde_json::json!({
                "checkpoint_id": checkpoint_id,
                "commit": commit,
                "safety_id": safety.id,
            }),
        );
        Ok(safety)
    }

    fn restore_conflict(
        &self,
        lock: &GitLockGuard<'_>,
        checkpoint_id: &str,
        safety: &Checkpoint,
        paths: Vec<String>,
    ) -> SpectrailError {
        self.audit.record(
            lock.holder_id(),
            "checkpoint.restore",
            "conflict",
            serde_json::json!({
                "checkpoint_id": checkpoint_id,
                "safety_id": safety.id,
                "paths": paths,
            }),
        );
        SpectrailError::RestoreConflict {
            checkpoint_id: checkpoint_id.to_string(),
            paths,
        }
    }

    /// Live checkpoints, newest first.
    pub fn list(&self) -> Vec<Checkpoint> {
        let mut live: Vec<Checkpoint> = Vec::new();
        for entry in self.read_log() {
            match entry {
                LogEntry::Created(cp) => {
                    live.retain(|c| c.id != cp.id);
                    live.push(cp);
                }
                LogEntry::Pruned { id, .. } => live.retain(|c| c.id != id),
            }
        }
        // Stable sort over reversed log order: equal timestamps list the
        // later append first.
        live.reverse();
        live.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        live
    }

    /// Keep the newest `keep` regular and the newest `keep` safety
    /// checkpoints; drop the rest and any orphaned refs.
    pub fn prune(
        &self,
        lock: &GitLockGuard<'_>,
        keep: usize,
    ) -> Result<PruneReport, SpectrailError> {
        let mut report = PruneReport::default();
        let (safety, regular): (Vec<_>, Vec<_>) =
            self.list().into_iter().partition(|cp| cp.is_safety);

        for cp in regular.into_iter().skip(keep).chain(safety.into_iter().skip(keep)) {
            if self.git.resolve(&cp.git_ref)?.is_some() {
                self.git.delete_ref(&cp.git_ref)?;
            }
            self.append(&LogEntry::Pruned {
                id: cp.id.clone(),
                pruned_at: time::now_epoch_ms(),
            })?;
            report.pruned.push(cp.id);
        }
        for refname in self.orphans()? {
            self.git.delete_ref(&refname)?;
            report.orphans_removed.push(refname);
        }
        self.audit.record(
            lock.holder_id(),
            "checkpoint.prune",
            "ok",
            serde_json::json!({
                "keep": keep,
                "pruned": report.pruned,
                "orphans_removed": report.orphans_removed,
            }),
        );
        Ok(report)
    }

    /// Checkpoint refs with no live log entry.
    pub fn orphans(&self) -> Result<Vec<String>, SpectrailError> {
        let live: Vec<String> = self.list().into_iter().map(|cp| cp.git_ref).collect();
        Ok(self
            .git
            .refs_under(CHECKPOINT_REF_PREFIX)?
            .into_iter()
            .filter(|r| !live.contains(r))
            .collect())
    }

    pub fn retain(&self) -> usize {
        self.config.retain
    }

    fn create(
        &self,
        lock: &GitLockGuard<'_>,
        kind: OperationKind,
        label: &str,
        reason: &str,
        is_safety: bool,
    ) -> Result<Checkpoint, SpectrailError> {
        let id = format!("cp-{}", Ulid::new());
        let git_ref = format!("{CHECKPOINT_REF_PREFIX}{id}");
        let created_at = time::now_epoch_ms();
        let commit = self.git.snapshot_commit()?;
        self.git.update_ref(&git_ref, &commit)?;

        let checkpoint = Checkpoint {
            id,
            git_ref,
            commit,
            operation_type: kind,
            label: label.to_string(),
            reason: reason.to_string(),
            is_safety,
            created_at,
        };
        self.append(&LogEntry::Created(checkpoint.clone()))?;
        self.audit.record(
            lock.holder_id(),
            "checkpoint.create",
            "ok",
            serde_json::json!({
                "id": checkpoint.id,
                "commit": checkpoint.commit,
                "reason": checkpoint.reason,
                "is_safety": is_safety,
            }),
        );
        Ok(checkpoint)
    }

    fn append(&self, entry: &LogEntry) -> Result<(), SpectrailError> {
        if let Some(parent) = self.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        // Terminate a torn trailing line so ours starts fresh.
        let torn = fs::read(&self.log_path)
            .map(|b| b.last().is_some_and(|&c| c != b'\n'))
            .unwrap_or(false);
        if torn {
            line.insert(0, '\n');
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        f.write_all(line.as_bytes())?;
        f.sync_all()?;
        Ok(())
    }

    fn read_log(&self) -> Vec<LogEntry> {
        let Ok(content) = fs::read_to_string(&self.log_path) else {
            return Vec::new();
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::warn!("ignoring undecodable checkpoint log line: {err}");
                    None
                }
            })
            .collect()
    }
}
