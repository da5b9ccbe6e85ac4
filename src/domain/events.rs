//! Event types emitted while a pipeline run progresses.
//!
//! Events are append-only. Within one run they carry a monotonically
//! increasing sequence number; items completing concurrently in the evidence
//! stage may interleave, but events about a single item are causally ordered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single event in a run's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    /// Position in the run's event sequence (starts at 0)
    pub seq: u64,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// What happened
    pub kind: EventKind,

    /// Pipeline stage the event belongs to
    pub stage: Stage,

    /// Free-form structured details (claim ids, counts, error messages)
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl StageEvent {
    /// Create a new event with the current timestamp
    pub fn new(
        seq: u64,
        run_id: Uuid,
        kind: EventKind,
        stage: Stage,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            seq,
            run_id,
            timestamp: Utc::now(),
            kind,
            stage,
            payload,
        }
    }

    /// Whether this event matches a kind and stage
    pub fn is(&self, kind: EventKind, stage: Stage) -> bool {
        self.kind == kind && self.stage == stage
    }

    /// Last event of a run: `Completed`, or the `Error` that ended it
    pub fn is_terminal(&self) -> bool {
        match self.kind {
            EventKind::Completed => true,
            EventKind::Error => self.payload.get("terminal").and_then(|v| v.as_bool()) == Some(true),
            _ => false,
        }
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A run has started
    Started,

    /// A stage finished for every item it was given
    StageCompleted,

    /// A single work item finished within a stage
    ItemCompleted,

    /// Something failed (an attempt, an item, or the run)
    Error,

    /// Something was skipped or degraded
    Warning,

    /// The run finished
    Completed,
}

/// Pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detect,
    Evidence,
    Verdict,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detect => "detect",
            Self::Evidence => "evidence",
            Self::Verdict => "verdict",
            Self::Complete => "complete",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
