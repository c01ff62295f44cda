//! Change-event pump.
//!
//! No OS file watching lives here. Whatever produces change notifications
//! (an editor hook, an agent harness, a `notify` loop in a host process)
//! hands them over as an iterator or an `mpsc` channel and the pump applies
//! them to the index one by one.

use crate::core::error::SpectrailError;
use crate::core::index::{ChangeEvent, ChangeOutcome, IndexManager};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::mpsc::Receiver;

#[derive(Debug, Default, Serialize)]
pub struct PumpReport {
    pub applied: Vec<ChangeOutcome>,
    pub failed: Vec<PumpFailure>,
}

#[derive(Debug, Serialize)]
pub struct PumpFailure {
    pub path: PathBuf,
    pub error: String,
}

impl PumpReport {
    /// Events that changed the persisted index.
    pub fn written(&self) -> usize {
        self.applied.iter().filter(|o| o.written).count()
    }
}

/// Apply every event. A failing event is recorded and the pump moves on.
pub fn pump<I>(manager: &IndexManager, events: I) -> PumpReport
where
    I: IntoIterator<Item = ChangeEvent>,
{
    let mut report = PumpReport::default();
    for event in events {
        match manager.process_change(&event.path, event.kind) {
            Ok(outcome) => report.applied.push(outcome),
            Err(err) => {
                tracing::warn!(path = %event.path.display(), "change event failed: {err}");
                report.failed.push(PumpFailure {
                    path: event.path,
                    error: err.to_string(),
                });
            }
        }
    }
    report
}

/// Drain a channel until every sender is dropped.
pub fn pump_channel(manager: &IndexManager, events: Receiver<ChangeEvent>) -> PumpReport {
    pump(manager, events)
}

/// Parse `<kind> <path>` lines (e.g. `modified src/lib.rs`) into events.
pub fn parse_event_lines(input: &str) -> Result<Vec<ChangeEvent>, SpectrailError> {
    input
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|line| {
            let (kind, path) = line.split_once(char::is_whitespace).ok_or_else(|| {
                SpectrailError::ValidationError(format!("expected '<kind> <path>', got '{line}'"))
            })?;
            Ok(ChangeEvent::new(path.trim(), kind.parse()?))
        })
        .collect()
}
