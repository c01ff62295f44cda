//! Consumers of the index: the linkage policy and the change-event pump.

pub mod policy;
pub mod watcher;
