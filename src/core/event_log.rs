//! Append-only run event log with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL) under
//! `<home>/runs/<run-id>/events.jsonl` for easy debugging/inspection.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::observers::ObserverFn;
use crate::domain::{EventKind, StageEvent};

/// File-based event log for one run
#[derive(Debug, Clone)]
pub struct EventLog {
    /// Directory containing the run
    run_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,
}

impl EventLog {
    /// Create or open the log for a run under the configured runs directory
    pub async fn open(run_id: Uuid) -> Result<Self> {
        let base_dir = Self::base_directory()?;
        Self::open_in(&base_dir, run_id).await
    }

    /// Create or open the log for a run under `base_dir`
    pub async fn open_in(base_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = base_dir.join(run_id.to_string());

        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        let events_path = run_dir.join("events.jsonl");

        Ok(Self {
            run_dir,
            events_path,
        })
    }

    /// Get the base directory for all runs (~/.verifact/runs or $VERIFACT_HOME/runs)
    pub fn base_directory() -> Result<PathBuf> {
        crate::config::runs_dir()
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Get the run directory
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Append an event to the log
    pub async fn append(&self, event: &StageEvent) -> Result<()> {
        self.append_all(std::slice::from_ref(event)).await
    }

    /// Append several events with a single write
    pub async fn append_all(&self, events: &[StageEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut buf = String::new();
        for event in events {
            buf.push_str(&serde_json::to_string(event).context("Failed to serialize event")?);
            buf.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open events file: {}",
                    self.events_path.display()
                )
            })?;

        file.write_all(buf.as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<StageEvent>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: StageEvent = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Get the last event of a specific kind
    pub async fn last_event_of_kind(&self, kind: EventKind) -> Result<Option<StageEvent>> {
        let events = self.replay().await?;
        Ok(events.into_iter().rev().find(|e| e.kind == kind))
    }

    /// List all run IDs in the configured runs directory
    pub async fn list_runs() -> Result<Vec<Uuid>> {
        let base_dir = Self::base_directory()?;
        Self::list_runs_in(&base_dir).await
    }

    /// List all run IDs under `base_dir`
    pub async fn list_runs_in(base_dir: &Path) -> Result<Vec<Uuid>> {
        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }

    /// Observer that persists every event under `base_dir`, one log per run.
    ///
    /// Writes happen on a background task. The task ends once the observer
    /// (and every clone of it) is dropped, yielding the number of events
    /// written.
    pub fn writer(base_dir: PathBuf) -> (ObserverFn, JoinHandle<usize>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<StageEvent>();

        let handle = tokio::spawn(async move {
            let mut logs = RunLogs::new(base_dir);
            while let Some(event) = rx.recv().await {
                logs.write(&event).await;
            }
            logs.written
        });

        let observer: ObserverFn = Arc::new(move |event: &StageEvent| {
            if tx.send(event.clone()).is_err() {
                debug!(run_id = %event.run_id, "Event log writer stopped, dropping event");
            }
        });

        (observer, handle)
    }
}

/// Open logs of the runs still in progress
struct RunLogs {
    base_dir: PathBuf,
    open: HashMap<Uuid, EventLog>,
    written: usize,
}

impl RunLogs {
    fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            open: HashMap::new(),
            written: 0,
        }
    }

    /// Append one event; a run's log is closed after its terminal event
    async fn write(&mut self, event: &StageEvent) {
        let log = match self.open.entry(event.run_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => match EventLog::open_in(&self.base_dir, event.run_id).await {
                Ok(log) => entry.insert(log),
                Err(e) => {
                    warn!(run_id = %event.run_id, error = %e, "Failed to open event log");
                    return;
                }
            },
        };
        match log.append(event).await {
            Ok(()) => self.written += 1,
            Err(e) => warn!(run_id = %event.run_id, error = %e, "Failed to persist event"),
        }

        if event.is_terminal() {
            self.open.remove(&event.run_id);
        }
    }
}
