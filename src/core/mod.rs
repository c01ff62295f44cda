//! Core modules: tag parsing, the tag index, git coordination, and the
//! shared primitives (errors, config, workspace paths, audit trail) they use.

pub mod audit;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod git;
pub mod git_lock;
pub mod index;
pub mod migration;
pub mod tags;
pub mod time;
pub mod workspace;
