//! Configuration for a workspace, loaded from `.spectrail/config.toml`.
//!
//! A missing file means defaults. A present but malformed file is an error:
//! silently falling back would drop exemptions or thresholds the operator set.

use crate::core::error::SpectrailError;
use crate::core::workspace::Workspace;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SpectrailConfig {
    pub index: IndexConfig,
    pub policy: PolicyConfig,
    pub lock: LockConfig,
    pub checkpoint: CheckpointConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexConfig {
    /// Index document location, relative to the state directory.
    pub path: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: "tag_index.json".to_string(),
        }
    }
}

/// What to do when the same spec_id + verb is declared from two files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Report a `duplicate-tag` violation.
    Reject,
    /// Accept; the occurrences are merged under one index entry.
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Paths never subject to tag policy. Matched against the repo-relative path.
    pub exempt: Vec<String>,
    /// Paths subject to tag policy.
    pub governed: Vec<String>,
    /// Governed paths that are tests (HIGH instead of CRITICAL when untagged).
    pub test_patterns: Vec<String>,
    pub strict_linkage: bool,
    pub duplicates: DuplicatePolicy,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            exempt: vec![
                "docs/**".to_string(),
                "**/docs/**".to_string(),
                "reports/**".to_string(),
                "**/generated/**".to_string(),
                "**/templates/**".to_string(),
                "**/vendor/**".to_string(),
                "examples/**".to_string(),
                "**/examples/**".to_string(),
                ".spectrail/**".to_string(),
            ],
            governed: [
                "rs", "py", "ts", "tsx", "js", "jsx", "go", "java", "kt", "c", "h", "cpp", "hpp",
                "cs", "rb", "swift", "sh",
            ]
            .iter()
            .map(|ext| format!("**/*.{ext}"))
            .collect(),
            test_patterns: vec![
                "tests/**".to_string(),
                "**/tests/**".to_string(),
                "**/test/**".to_string(),
                "**/test_*".to_string(),
                "**/*_test.*".to_string(),
                "**/*.test.*".to_string(),
                "**/*.spec.*".to_string(),
            ],
            strict_linkage: false,
            duplicates: DuplicatePolicy::Reject,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    /// Upper bound for `acquire(wait = true)`.
    pub timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// An undecodable lock record younger than this is assumed mid-write.
    pub corrupt_grace_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            initial_backoff_ms: 10,
            max_backoff_ms: 500,
            corrupt_grace_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Deletions touching more paths than this are risky.
    pub delete_threshold: usize,
    /// Renames/moves touching more paths than this are risky.
    pub rename_threshold: usize,
    /// Any touched path matching one of these is risky.
    pub critical_files: Vec<String>,
    /// Checkpoints of each kind kept by `prune`.
    pub retain: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            delete_threshold: 5,
            rename_threshold: 5,
            critical_files: vec![
                ".spectrail/config.toml".to_string(),
                "Cargo.toml".to_string(),
                "package.json".to_string(),
                "**/*.lock".to_string(),
                ".github/**".to_string(),
                "specs/**".to_string(),
                "**/POLICY*.md".to_string(),
                "AGENTS.md".to_string(),
                "CLAUDE.md".to_string(),
            ],
            retain: 20,
        }
    }
}

impl SpectrailConfig {
    pub fn load(workspace: &Workspace) -> Result<Self, SpectrailError> {
        let path = workspace.config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path).map_err(SpectrailError::IoError)?;
        toml::from_str(&content).map_err(|e| SpectrailError::ConfigParse {
            path: path.clone(),
            message: e.to_string(),
        })
    }

    /// Write the config unless one already exists. Returns whether it wrote.
    pub fn write_default(workspace: &Workspace) -> Result<bool, SpectrailError> {
        let path = workspace.config_path();
        if path.exists() {
            return Ok(false);
        }
        workspace.ensure_state_dir()?;
        let body = toml::to_string_pretty(&Self::default()).map_err(|e| {
            SpectrailError::ConfigParse {
                path: path.clone(),
                message: e.to_string(),
            }
        })?;
        fs::write(&path, body).map_err(SpectrailError::IoError)?;
        Ok(true)
    }
}
