//! Thin wrapper over the `git` binary.
//!
//! Every call goes through `GitRepo::run`, which turns a non-zero exit into
//! `SpectrailError::GitOperationFailure` carrying the arguments and stderr.

use crate::core::error::SpectrailError;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run git and return the raw output, whatever the exit status.
    pub fn output(&self, args: &[&str]) -> Result<Output, SpectrailError> {
        tracing::debug!(args = %args.join(" "), "git");
        Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .map_err(|e| SpectrailError::GitOperationFailure {
                context: "spawn".to_string(),
                args: args.join(" "),
                stderr: e.to_string(),
            })
    }

    /// Run git; non-zero exit is an error. Returns trimmed stdout.
    pub fn run(&self, context: &str, args: &[&str]) -> Result<String, SpectrailError> {
        let output = self.output(args)?;
        if !output.status.success() {
            return Err(SpectrailError::GitOperationFailure {
                context: context.to_string(),
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn head(&self) -> Result<String, SpectrailError> {
        self.run("resolve HEAD", &["rev-parse", "--verify", "HEAD"])
    }

    /// Commit a ref points to, or `None` if the ref does not exist.
    pub fn resolve(&self, refname: &str) -> Result<Option<String>, SpectrailError> {
        let spec = format!("{refname}^{{commit}}");
        let output = self.output(&["rev-parse", "--verify", "--quiet", &spec])?;
        if output.status.success() {
            Ok(Some(
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
            ))
        } else {
            Ok(None)
        }
    }

    /// Tracked paths with staged or unstaged changes.
    pub fn dirty_paths(&self) -> Result<Vec<String>, SpectrailError> {
        let out = self.run(
            "status",
            &["status", "--porcelain", "--untracked-files=no"],
        )?;
        Ok(out
            .lines()
            .filter_map(|line| line.get(3..))
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect())
    }

    /// Untracked, non-ignored paths in the working tree.
    pub fn untracked_paths(&self) -> Result<Vec<String>, SpectrailError> {
        let out = self.run(
            "list untracked",
            &["ls-files", "--others", "--exclude-standard"],
        )?;
        Ok(lines(&out))
    }

    /// Every file path tracked in `commit`'s tree.
    pub fn tree_paths(&self, commit: &str) -> Result<Vec<String>, SpectrailError> {
        let out = self.run("list tree", &["ls-tree", "-r", "--name-only", commit])?;
        Ok(lines(&out))
    }

    /// Snapshot commit of the current state: a `git stash create` commit when
    /// tracked changes exist, otherwise HEAD. The working tree is untouched.
    pub fn snapshot_commit(&self) -> Result<String, SpectrailError> {
        if !self.dirty_paths()?.is_empty() {
            let stash = self.run("snapshot working tree", &["stash", "create"])?;
            if !stash.is_empty() {
                return Ok(stash);
            }
        }
        self.head()
    }

    pub fn update_ref(&self, refname: &str, commit: &str) -> Result<(), SpectrailError> {
        self.run("create checkpoint ref", &["update-ref", refname, commit])
            .map(|_| ())
    }

    pub fn delete_ref(&self, refname: &str) -> Result<(), SpectrailError> {
        self.run("delete checkpoint ref", &["update-ref", "-d", refname])
            .map(|_| ())
    }

    /// Ref names under `prefix`.
    pub fn refs_under(&self, prefix: &str) -> Result<Vec<String>, SpectrailError> {
        let out = self.run(
            "list refs",
            &["for-each-ref", "--format=%(refname)", prefix],
        )?;
        Ok(lines(&out))
    }
}

fn lines(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Paths git names in a "would be overwritten by checkout" refusal.
pub fn overwritten_paths(stderr: &str) -> Option<Vec<String>> {
    let mut paths = Vec::new();
    let mut in_list = false;
    let mut refused = false;
    for line in stderr.lines() {
        if line.contains("would be overwritten by checkout")
            || line.contains("would be removed by checkout")
        {
            in_list = true;
            refused = true;
            continue;
        }
        if in_list {
            if line.starts_with(['\t', ' ']) && !line.trim().is_empty() {
                paths.push(line.trim().to_string());
            } else {
                in_list = false;
            }
        }
    }
    refused.then_some(paths)
}
