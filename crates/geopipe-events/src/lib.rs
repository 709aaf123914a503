//! Append-only run event log and summary reduction for geopipe.
//!
//! This crate mirrors the teacher's `EventLog`: events are recorded
//! in-memory during a run and additionally persisted as one JSON line per
//! event under `<stateDir>/run-events.jsonl`, so a crashed run leaves a
//! forensic trail instead of losing every in-flight event. `finalize()` is a
//! pure reduction — it never controls flow, it only summarizes what already
//! happened.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use geopipe_types::{EventStatus, Phase, RunEvent, RunReduction, RunTotals, SourceOutcome};

/// Default run-events file name.
pub const EVENTS_FILE: &str = "run-events.jsonl";

/// Get the run-events file path for a state directory.
pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// Append-only event log for one pipeline run, single-writer discipline
/// (guarded by a mutex at the orchestrator level, mirroring the teacher's
/// `Arc<Mutex<EventLog>>` usage).
#[derive(Debug)]
pub struct RunEventLog {
    events: Vec<RunEvent>,
    outcomes: std::collections::BTreeMap<String, SourceOutcome>,
    started_at: Instant,
}

impl Default for RunEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RunEventLog {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            outcomes: std::collections::BTreeMap::new(),
            started_at: Instant::now(),
        }
    }

    /// Record one `{phase, status, detail}` event for a source.
    pub fn record(
        &mut self,
        source_id: impl Into<String>,
        phase: Phase,
        status: EventStatus,
        detail: impl Into<String>,
    ) {
        self.events.push(RunEvent {
            timestamp: chrono::Utc::now(),
            source_id: source_id.into(),
            phase,
            status,
            detail: detail.into(),
        });
    }

    /// Record a source's terminal outcome. A source contributes exactly one
    /// terminal record; calling this twice for the same id overwrites it.
    pub fn set_outcome(&mut self, source_id: impl Into<String>, outcome: SourceOutcome) {
        self.outcomes.insert(source_id.into(), outcome);
    }

    /// Reduce recorded events and outcomes into a [`RunReduction`].
    pub fn finalize(&self) -> RunReduction {
        let mut totals = RunTotals::default();

        for event in &self.events {
            match (event.phase, event.status) {
                (Phase::Download, EventStatus::Ok) => totals.downloaded += 1,
                (Phase::Stage, EventStatus::Ok) => totals.staged += 1,
                (_, EventStatus::Skipped) => totals.skipped += 1,
                (_, EventStatus::Failed) => totals.failed += 1,
                _ => {}
            }
        }

        totals.partial = self
            .outcomes
            .values()
            .filter(|o| matches!(o, SourceOutcome::Partial))
            .count();

        RunReduction {
            per_source: self.outcomes.clone(),
            totals,
            wall_seconds: self.started_at.elapsed().as_secs_f64(),
        }
    }

    /// Append all recorded events to `path` in JSONL format.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut writer = std::io::BufWriter::new(file);
        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
            writeln!(writer, "{line}").context("failed to write event line")?;
        }
        writer.flush().context("failed to flush events file")?;

        Ok(())
    }

    /// Read all events from a JSONL file (outcomes are not persisted; a
    /// re-read log has an empty `per_source` until outcomes are replayed).
    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line.with_context(|| {
                format!("failed to read line from events file {}", path.display())
            })?;
            let event: RunEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event JSON from line: {line}"))?;
            events.push(event);
        }

        Ok(Self {
            events,
            outcomes: std::collections::BTreeMap::new(),
            started_at: Instant::now(),
        })
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
