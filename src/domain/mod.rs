//! Domain types for the verifact orchestrator.
//!
//! This module contains the core data structures:
//! - Claim/Evidence/Verdict: values exchanged with the collaborators
//! - Stage: per-item stage outcomes and the failure taxonomy
//! - Events: append-only records of run progress
//! - Run: pipeline run state and statistics

pub mod claim;
pub mod events;
pub mod run;
pub mod stage;

// Re-export commonly used types
pub use claim::{Claim, Evidence, Stance, ValidationError, Verdict, VerdictLabel};
pub use events::{EventKind, Stage, StageEvent};
pub use run::{InvalidTransition, PipelineRun, RunState, Stats};
pub use stage::{ErrorInfo, ErrorKind, StageResult, WorkItem};
