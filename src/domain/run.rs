//! Run state, statistics and the frozen record of one pipeline invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::claim::Verdict;
use super::events::{EventKind, Stage, StageEvent};

/// One invocation of the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Current state of the run
    pub state: RunState,

    /// Every event emitted during the run, in sequence order
    pub events: Vec<StageEvent>,

    /// Counters and timings
    pub stats: Stats,

    /// Verdicts in original claim order
    pub verdicts: Vec<Verdict>,

    /// Set when the run-level timeout expired
    #[serde(default)]
    pub timed_out: bool,
}

impl PipelineRun {
    /// Create a new idle run
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            state: RunState::Idle,
            events: Vec::new(),
            stats: Stats::new(),
            verdicts: Vec::new(),
            timed_out: false,
        }
    }

    /// Move to the next state if the state machine allows it
    pub fn transition(&mut self, next: RunState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(&next) {
            return Err(InvalidTransition {
                from: self.state.clone(),
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Record an event and bump the matching counters
    pub fn record(&mut self, event: StageEvent) {
        match event.kind {
            EventKind::Error => self.stats.errors += 1,
            EventKind::Warning => self.stats.warnings += 1,
            _ => {}
        }
        self.events.push(event);
    }

    /// Events of one kind, in order
    pub fn events_of(&self, kind: EventKind) -> impl Iterator<Item = &StageEvent> {
        self.events.iter().filter(move |e| e.kind == kind)
    }

    /// Events for one stage, in order
    pub fn events_for(&self, stage: Stage) -> impl Iterator<Item = &StageEvent> {
        self.events.iter().filter(move |e| e.stage == stage)
    }

    /// Check if the run is still in progress
    pub fn is_running(&self) -> bool {
        !self.state.is_terminal()
    }
}

/// Invalid state machine move
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid run transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: RunState,
    pub to: RunState,
}

/// State of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Created, nothing started yet
    Idle,

    /// Stage 1
    Detecting,

    /// Stage 2
    GatheringEvidence,

    /// Stage 3
    WritingVerdicts,

    /// Finished (possibly with partial results)
    Complete,

    /// Failed; terminal for the run
    Error { error: String },
}

impl Default for RunState {
    fn default() -> Self {
        Self::Idle
    }
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error { .. })
    }

    /// Allowed moves. `Error` is reachable from every non-terminal state.
    pub fn can_transition_to(&self, next: &RunState) -> bool {
        use RunState::*;

        match (self, next) {
            (Complete | Error { .. }, _) => false,
            (_, Error { .. }) => true,
            (Idle, Detecting) => true,
            (Detecting, GatheringEvidence) => true,
            (Detecting, Complete) => true,
            (GatheringEvidence, WritingVerdicts) => true,
            (GatheringEvidence, Complete) => true,
            (WritingVerdicts, Complete) => true,
            _ => false,
        }
    }
}

/// Counters and timings for one run. Counters never decrease.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_processing_ms: Option<u64>,
    pub detect_ms: Option<u64>,
    pub evidence_ms: Option<u64>,
    pub verdict_ms: Option<u64>,

    /// Claims returned by the detector, before filtering
    pub claims_detected: u64,

    /// Claims that survived validation, score filter and count cap
    pub claims_checked: u64,

    pub evidence_gathered: u64,
    pub verdicts_generated: u64,
    pub errors: u64,
    pub warnings: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_started(&mut self) {
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            self.total_processing_ms = Some((now - started).num_milliseconds().max(0) as u64);
        }
    }
}
