//! Append-only audit trail for index writes, lock transitions and checkpoints.
//!
//! One JSON object per line in `.spectrail/events.jsonl`. Appending is
//! best-effort: a failed audit write is logged and never fails the operation
//! being audited.

use crate::core::time;
use crate::core::workspace::Workspace;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuditEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub op: String,
    pub status: String,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(workspace: &Workspace) -> Self {
        Self {
            path: workspace.events_path(),
        }
    }

    pub fn record(&self, actor: &str, op: &str, status: &str, details: serde_json::Value) {
        let ev = AuditEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            actor: actor.to_string(),
            op: op.to_string(),
            status: status.to_string(),
            details,
        };
        if let Err(err) = self.append(&ev) {
            tracing::warn!(op, path = %self.path.display(), "audit append failed: {err}");
        }
    }

    fn append(&self, ev: &AuditEvent) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(ev).map_err(std::io::Error::other)?;
        line.push('\n');
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        f.write_all(line.as_bytes())
    }

    /// Decoded events, oldest first. Undecodable lines are skipped.
    pub fn read_all(&self) -> Vec<AuditEvent> {
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}
