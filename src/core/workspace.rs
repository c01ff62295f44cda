//! Workspace handle for a single repository.
//!
//! Every component receives a `Workspace` (and a `SpectrailConfig`) explicitly;
//! nothing in the crate reads a process-global "current project".

use crate::core::error::SpectrailError;
use std::path::{Component, Path, PathBuf};

/// Name of the state directory under the repository root.
pub const STATE_DIR_NAME: &str = ".spectrail";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const LOCK_FILE_NAME: &str = "git.lock";
pub const CHECKPOINT_LOG_NAME: &str = "checkpoints.jsonl";
pub const EVENTS_LOG_NAME: &str = "events.jsonl";

/// Namespace under which checkpoint refs are created.
pub const CHECKPOINT_REF_PREFIX: &str = "refs/spectrail/checkpoints/";

#[derive(Debug, Clone)]
pub struct Workspace {
    /// Absolute repository root (the git working tree).
    pub root: PathBuf,
    /// `<root>/.spectrail`
    pub state_dir: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(STATE_DIR_NAME);
        Self { root, state_dir }
    }

    /// Walk upwards from `start` looking for a state directory or a `.git` entry.
    pub fn discover(start: &Path) -> Result<Self, SpectrailError> {
        let mut current = Some(start);
        while let Some(dir) = current {
            if dir.join(STATE_DIR_NAME).is_dir() || dir.join(".git").exists() {
                return Ok(Self::new(dir));
            }
            current = dir.parent();
        }
        Err(SpectrailError::NotFound(format!(
            "no repository found above {}",
            start.display()
        )))
    }

    pub fn ensure_state_dir(&self) -> Result<(), SpectrailError> {
        std::fs::create_dir_all(&self.state_dir).map_err(SpectrailError::IoError)
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE_NAME)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join(LOCK_FILE_NAME)
    }

    pub fn checkpoint_log_path(&self) -> PathBuf {
        self.state_dir.join(CHECKPOINT_LOG_NAME)
    }

    pub fn events_path(&self) -> PathBuf {
        self.state_dir.join(EVENTS_LOG_NAME)
    }

    /// Repository-relative, forward-slash form of `path`, used as the key in
    /// the index `files` manifest and for policy glob matching.
    pub fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        normalize_rel(rel)
    }

    /// Repository-relative key for `path`, which must lie inside the root.
    /// Relative paths are taken from the root; `..` is resolved lexically.
    pub fn contained(&self, path: &Path) -> Result<String, SpectrailError> {
        let root = lexical(&self.root);
        let abs = lexical(&root.join(path));
        match abs.strip_prefix(&root) {
            Ok(rel) if rel.components().next().is_some() => Ok(normalize_rel(rel)),
            _ => Err(SpectrailError::ValidationError(format!(
                "{} is outside the repository root {}",
                path.display(),
                self.root.display()
            ))),
        }
    }

    /// Absolute path for a repository-relative key.
    pub fn absolute(&self, rel: &str) -> PathBuf {
        let p = Path::new(rel);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }
}

fn lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn normalize_rel(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(s) => parts.push(s.to_string_lossy().to_string()),
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    parts.join("/")
}
