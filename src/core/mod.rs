//! Core orchestration logic.
//!
//! This module contains:
//! - Orchestrator: three-stage fact-check runs
//! - Batch: bounded-concurrency fan-out with progress and cancellation
//! - Client: model calls with fallback, retry, caching and rate limiting
//! - Cache / RateLimiter: two-tier response cache and sliding-window limiter
//! - Observers / EventLog: event delivery and JSONL persistence

pub mod batch;
pub mod cache;
pub mod client;
pub mod event_log;
pub mod observers;
pub mod orchestrator;
pub mod rate_limiter;
pub mod retry;

// Re-export commonly used types
pub use batch::{BatchConfig, BatchOutcome, BatchProgress, BoundedBatchRunner, ProgressFn};
pub use cache::{namespaces, Cache, CacheBackend, CacheSettings, NamespacedCache};
pub use client::{Completion, FallbackChain, ModelError, ResilientCallClient};
pub use event_log::EventLog;
pub use observers::{logging_observer, ObserverFn, ObserverId, Observers};
pub use orchestrator::{Orchestrator, PipelineConfig, PipelineError, VerdictStream};
pub use rate_limiter::{RateLimitResult, RateLimitSettings, RateLimiter, RateStore};
pub use retry::RetryPolicy;
