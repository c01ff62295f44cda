//! File-based mutual exclusion for git-mutating call sequences.
//!
//! The lock is `.spectrail/git.lock`. Acquisition is one `create_new` (the
//! `O_CREAT|O_EXCL` single-winner primitive), after which the JSON record is
//! written and fsynced. A record whose process is gone, or an undecodable
//! record older than `lock.corrupt_grace_ms`, is stale and may be cleared by
//! any acquirer.
//!
//! Stale clearing renames the lock aside to a unique tombstone first and then
//! checks that the tombstone holds the exact bytes judged stale. If a new
//! holder slipped in between the check and the rename, its record is put back
//! with `hard_link`, which never overwrites an existing lock. When even that
//! loses to a third acquirer, the sweeper gets `LockContention` and the lost
//! acquisition is recorded in the audit log.

use crate::core::audit::AuditLog;
use crate::core::config::LockConfig;
use crate::core::error::SpectrailError;
use crate::core::time;
use crate::core::workspace::Workspace;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder_id: String,
    pub operation: String,
    pub description: String,
    /// Epoch milliseconds.
    pub acquired_at: u64,
    pub process_id: u32,
    /// Identifies one acquisition; release must present it.
    pub lock_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LockState {
    Free,
    Held { record: LockRecord },
    /// Dead holder, or an undecodable record past the grace period.
    Stale { record: Option<LockRecord> },
    /// Undecodable record still inside the grace period (mid-write).
    Settling,
}

enum Observed {
    Gone,
    Live(LockRecord),
    Settling,
    Stale(Vec<u8>, Option<LockRecord>),
}

pub struct GitLockManager {
    path: PathBuf,
    config: LockConfig,
    audit: AuditLog,
    owner_pid: u32,
    /// holder_id → lock_id for acquisitions made through this manager.
    held: Mutex<FxHashMap<String, String>>,
}

impl GitLockManager {
    pub fn new(workspace: &Workspace, config: &LockConfig) -> Self {
        Self {
            path: workspace.lock_path(),
            config: config.clone(),
            audit: AuditLog::new(workspace),
            owner_pid: std::process::id(),
            held: Mutex::new(FxHashMap::default()),
        }
    }

    /// Record `pid` as the owning process instead of the current one. Used by
    /// the CLI, whose own process exits right after acquiring.
    pub fn with_owner_pid(mut self, pid: u32) -> Self {
        self.owner_pid = pid;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn acquire(
        &self,
        holder_id: &str,
        operation: &str,
        description: &str,
        wait: bool,
    ) -> Result<GitLockGuard<'_>, SpectrailError> {
        let started = Instant::now();
        let mut backoff = self.config.initial_backoff_ms.max(1);

        loop {
            if let Some(record) = self.try_create(holder_id, operation, description)? {
                self.remember(holder_id, &record.lock_id);
                self.audit.record(
                    holder_id,
                    "lock.acquire",
                    "ok",
                    serde_json::json!({
                        "operation": operation,
                        "lock_id": record.lock_id,
                        "process_id": record.process_id,
                    }),
                );
                return Ok(GitLockGuard {
                    manager: self,
                    record,
                    released: false,
                });
            }

            let holder = match self.observe() {
                Observed::Gone => continue,
                Observed::Stale(bytes, record) => {
                    if let Err(err) = self.clear_stale(&bytes, record.as_ref(), holder_id)
                        && !wait
                    {
                        return Err(err);
                    }
                    continue;
                }
                Observed::Live(record) => Some(record),
                Observed::Settling => None,
            };

            if !wait {
                let record = holder.unwrap_or_else(unknown_holder);
                return Err(SpectrailError::LockContention {
                    holder_id: record.holder_id,
                    operation: record.operation,
                    description: record.description,
                    process_id: record.process_id,
                });
            }

            let waited_ms = started.elapsed().as_millis() as u64;
            if waited_ms >= self.config.timeout_ms {
                let record = holder.unwrap_or_else(unknown_holder);
                self.audit.record(
                    holder_id,
                    "lock.acquire",
                    "timeout",
                    serde_json::json!({"waited_ms": waited_ms, "held_by": record.holder_id}),
                );
                return Err(SpectrailError::LockTimeout {
                    waited_ms,
                    holder_id: record.holder_id,
                    operation: record.operation,
                });
            }
            let remaining = self.config.timeout_ms - waited_ms;
            let sleep_ms = (backoff + jitter_ms(backoff / 2 + 1)).min(remaining.max(1));
            std::thread::sleep(Duration::from_millis(sleep_ms));
            backoff = (backoff * 2).min(self.config.max_backoff_ms.max(1));
        }
    }

    /// Guard for a live lock `holder_id` already holds under `lock_id`,
    /// typically taken by an earlier process via `detach`. The lock stays
    /// held when the guard drops.
    pub fn adopt(&self, holder_id: &str, lock_id: &str) -> Result<GitLockGuard<'_>, SpectrailError> {
        match self.observe() {
            Observed::Live(record) if record.holder_id == holder_id && record.lock_id == lock_id => {
                Ok(GitLockGuard {
                    manager: self,
                    record,
                    released: true,
                })
            }
            Observed::Live(record) => Err(SpectrailError::LockContention {
                holder_id: record.holder_id,
                operation: record.operation,
                description: record.description,
                process_id: record.process_id,
            }),
            _ => Err(SpectrailError::NotLockHolder(holder_id.to_string())),
        }
    }

    /// Release the acquisition `holder_id` made through this manager.
    pub fn release(&self, holder_id: &str) -> Result<(), SpectrailError> {
        let lock_id = self
            .held
            .lock()
            .ok()
            .and_then(|held| held.get(holder_id).cloned())
            .ok_or_else(|| SpectrailError::NotLockHolder(holder_id.to_string()))?;
        self.release_record(holder_id, &lock_id)
    }

    /// Release by explicit acquisition identity (used across processes).
    pub fn release_record(&self, holder_id: &str, lock_id: &str) -> Result<(), SpectrailError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.forget(holder_id);
                return Err(SpectrailError::NotLockHolder(holder_id.to_string()));
            }
            Err(err) => return Err(SpectrailError::IoError(err)),
        };
        let matches = serde_json::from_slice::<LockRecord>(&bytes)
            .is_ok_and(|r| r.holder_id == holder_id && r.lock_id == lock_id);
        if !matches {
            return Err(SpectrailError::NotLockHolder(holder_id.to_string()));
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(SpectrailError::IoError(err)),
        }
        self.forget(holder_id);
        self.audit.record(
            holder_id,
            "lock.release",
            "ok",
            serde_json::json!({"lock_id": lock_id}),
        );
        Ok(())
    }

    pub fn status(&self) -> LockState {
        match self.observe() {
            Observed::Gone => LockState::Free,
            Observed::Live(record) => LockState::Held { record },
            Observed::Settling => LockState::Settling,
            Observed::Stale(_, record) => LockState::Stale { record },
        }
    }

    fn try_create(
        &self,
        holder_id: &str,
        operation: &str,
        description: &str,
    ) -> Result<Option<LockRecord>, SpectrailError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(SpectrailError::IoError)?;
        }
        let mut file = match OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => return Err(SpectrailError::IoError(err)),
        };

        let record = LockRecord {
            holder_id: holder_id.to_string(),
            operation: operation.to_string(),
            description: description.to_string(),
            acquired_at: time::now_epoch_ms(),
            process_id: self.owner_pid,
            lock_id: Ulid::new().to_string(),
        };
        let written = serde_json::to_vec(&record)
            .map_err(std::io::Error::other)
            .and_then(|bytes| {
                file.write_all(&bytes)?;
                file.sync_all()
            });
        if let Err(err) = written {
            let _ = fs::remove_file(&self.path);
            return Err(SpectrailError::IoError(err));
        }
        Ok(Some(record))
    }

    fn observe(&self) -> Observed {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(_) => return Observed::Gone,
        };
        match serde_json::from_slice::<LockRecord>(&bytes) {
            Ok(record) if process_alive(record.process_id) => Observed::Live(record),
            Ok(record) => Observed::Stale(bytes, Some(record)),
            Err(_) => {
                let age_ms = fs::metadata(&self.path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.elapsed().ok())
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                if age_ms >= self.config.corrupt_grace_ms {
                    Observed::Stale(bytes, None)
                } else {
                    Observed::Settling
                }
            }
        }
    }

    fn clear_stale(
        &self,
        observed: &[u8],
        record: Option<&LockRecord>,
        cleared_by: &str,
    ) -> Result<(), SpectrailError> {
        let tombstone = self.path.with_extension(format!("lock.stale-{}", Ulid::new()));
        if fs::rename(&self.path, &tombstone).is_err() {
            return Ok(());
        }
        let swept = fs::read(&tombstone).unwrap_or_default();
        let result = if swept == observed {
            tracing::warn!(
                holder = record.map(|r| r.holder_id.as_str()).unwrap_or("<unreadable>"),
                pid = record.map(|r| r.process_id).unwrap_or(0),
                "cleared stale git lock"
            );
            self.audit.record(
                cleared_by,
                "lock.stale_clear",
                "ok",
                serde_json::json!({
                    "stale_holder": record.map(|r| r.holder_id.clone()),
                    "stale_lock_id": record.map(|r| r.lock_id.clone()),
                }),
            );
            Ok(())
        } else {
            self.restore_swept(&tombstone, &swept, cleared_by)
        };
        let _ = fs::remove_file(&tombstone);
        result
    }

    /// Put a live lock swept by mistake back in place. If another acquirer
    /// took the path in the meantime the swept acquisition is lost; that is
    /// audited and reported to the sweeper as contention.
    fn restore_swept(
        &self,
        tombstone: &Path,
        swept: &[u8],
        cleared_by: &str,
    ) -> Result<(), SpectrailError> {
        let Err(err) = fs::hard_link(tombstone, &self.path) else {
            return Ok(());
        };
        let lost = serde_json::from_slice::<LockRecord>(swept).ok();
        tracing::warn!("fresh git lock swept during stale cleanup could not be restored: {err}");
        self.audit.record(
            cleared_by,
            "lock.stale_clear",
            "restore_failed",
            serde_json::json!({
                "lost_holder": lost.as_ref().map(|r| r.holder_id.clone()),
                "lost_lock_id": lost.as_ref().map(|r| r.lock_id.clone()),
                "error": err.to_string(),
            }),
        );
        let record = match self.observe() {
            Observed::Live(current) => current,
            _ => lost.unwrap_or_else(unknown_holder),
        };
        Err(SpectrailError::LockContention {
            holder_id: record.holder_id,
            operation: record.operation,
            description: record.description,
            process_id: record.process_id,
        })
    }

    fn remember(&self, holder_id: &str, lock_id: &str) {
        if let Ok(mut held) = self.held.lock() {
            held.insert(holder_id.to_string(), lock_id.to_string());
        }
    }

    fn forget(&self, holder_id: &str) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(holder_id);
        }
    }
}

/// Proof that the git lock is held. Releases on drop.
pub struct GitLockGuard<'a> {
    manager: &'a GitLockManager,
    record: LockRecord,
    released: bool,
}

impl GitLockGuard<'_> {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn holder_id(&self) -> &str {
        &self.record.holder_id
    }

    pub fn release(mut self) -> Result<(), SpectrailError> {
        self.released = true;
        self.manager
            .release_record(&self.record.holder_id, &self.record.lock_id)
    }

    /// Leave the lock on disk and return its record; the caller releases it
    /// later with `release_record`.
    pub fn detach(mut self) -> LockRecord {
        self.released = true;
        self.manager.forget(&self.record.holder_id);
        self.record.clone()
    }
}

impl Drop for GitLockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self
                .manager
                .release_record(&self.record.holder_id, &self.record.lock_id);
        }
    }
}

fn unknown_holder() -> LockRecord {
    LockRecord {
        holder_id: "<writing>".to_string(),
        operation: "unknown".to_string(),
        description: "lock record is being written".to_string(),
        acquired_at: 0,
        process_id: 0,
        lock_id: String::new(),
    }
}

fn jitter_ms(max_exclusive: u64) -> u64 {
    if max_exclusive <= 1 {
        return 0;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    (nanos ^ std::process::id() as u64) % max_exclusive
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    unsafe {
        if libc::kill(pid, 0) == 0 {
            return true;
        }
    }
    matches!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::EPERM)
    )
}

#[cfg(not(unix))]
pub fn process_alive(pid: u32) -> bool {
    pid != 0
}
