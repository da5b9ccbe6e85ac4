//! verifact - Resilient fact-check pipeline orchestrator
//!
//! Takes a piece of text through three stages (claim detection, evidence
//! gathering, verdict writing), calling slow and unreliable model providers
//! without unbounded concurrency, without repeating identical calls and
//! without hammering a provider that has started failing.
//!
//! # Architecture
//!
//! - Every run is a small state machine whose transitions are recorded as
//!   [`StageEvent`]s and delivered to observers
//! - Evidence is gathered for all claims concurrently, under a worker ceiling
//! - Model calls go through a cache, a rate limiter and an ordered fallback
//!   chain with bounded retry
//!
//! # Modules
//!
//! - `adapters`: Provider interface, OpenRouter client, SQLite store
//! - `agents`: Collaborator traits and their model-backed implementations
//! - `core`: Orchestrator, batch runner, resilient client, cache, rate limiter
//! - `domain`: Data structures (Claim, Evidence, Verdict, StageEvent, PipelineRun)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Check a piece of text
//! echo "The Eiffel Tower is 330 metres tall." | verifact check
//!
//! # Inspect what happened
//! verifact runs
//! verifact events <run-id>
//! ```

pub mod adapters;
pub mod agents;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use agents::{create_default_pipeline, ClaimDetector, EvidenceHunter, VerdictWriter};
pub use core::{
    BoundedBatchRunner, Cache, Orchestrator, PipelineConfig, PipelineError, RateLimiter,
    ResilientCallClient,
};
pub use domain::{
    Claim, EventKind, Evidence, PipelineRun, RunState, Stage, StageEvent, StageResult, Verdict,
    VerdictLabel,
};
