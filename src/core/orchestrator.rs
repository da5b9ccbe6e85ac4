//! Main orchestrator for fact-check runs.
//!
//! Drives one piece of text through three stages:
//!
//! 1. Detect: one call to the claim detector, retried with a fixed delay,
//!    then validation, a minimum-score filter and a count cap.
//! 2. Evidence: the evidence hunter fanned out over all claims by the
//!    [`BoundedBatchRunner`].
//! 3. Verdict: the verdict writer called for each claim that has evidence,
//!    walking claims in their original order.
//!
//! Every transition is recorded as a [`StageEvent`] on the run and delivered
//! to the registered observers. The whole run is bounded by a timeout; on
//! expiry the partial run is returned.
//!
//! Each run gets its own cancellation token, a child of the orchestrator's
//! current generation. [`Orchestrator::cancel`] stops the runs in flight and
//! starts a new generation, so later runs are unaffected. Cancelling the
//! token passed to [`Orchestrator::with_cancellation`] stops everything.

use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::agents::{AgentError, ClaimDetector, EvidenceHunter, VerdictWriter};
use crate::core::batch::{BatchConfig, BatchProgress, BoundedBatchRunner, ProgressFn};
use crate::core::client::ModelError;
use crate::core::observers::{ObserverFn, ObserverId, Observers};
use crate::core::retry::RetryPolicy;
use crate::domain::{
    Claim, ErrorInfo, ErrorKind, EventKind, Evidence, PipelineRun, RunState, Stage, StageEvent,
    StageResult, Verdict,
};

/// Pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Claims scoring below this are dropped
    #[serde(default = "default_min_check_worthiness")]
    pub min_check_worthiness: f64,

    /// Keep at most this many claims (after the score filter)
    #[serde(default)]
    pub max_claims: Option<usize>,

    /// Evidence calls in flight at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Attempts per stage call, including the first
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Fixed delay between stage attempts
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Bound on the whole run
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Bound on one evidence item, retries included
    #[serde(default)]
    pub evidence_timeout_seconds: Option<u64>,

    /// Propagate stage failures and timeouts instead of returning partial results
    #[serde(default)]
    pub raise_on_error: bool,
}

fn default_min_check_worthiness() -> f64 {
    0.5
}
fn default_max_concurrent() -> usize {
    5
}
fn default_retry_attempts() -> u32 {
    2
}
fn default_retry_delay() -> u64 {
    1000
}
fn default_timeout() -> u64 {
    120
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_check_worthiness: default_min_check_worthiness(),
            max_claims: None,
            max_concurrent: default_max_concurrent(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay(),
            timeout_seconds: default_timeout(),
            evidence_timeout_seconds: None,
            raise_on_error: false,
        }
    }
}

impl PipelineConfig {
    pub fn stage_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.retry_attempts.max(1), Duration::from_millis(self.retry_delay_ms))
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Errors surfaced by [`Orchestrator::run`]
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{stage} stage failed: {source}")]
    Stage { stage: Stage, source: AgentError },

    #[error("authentication failed during {stage}: {message}")]
    Authentication { stage: Stage, message: String },

    #[error("pipeline timed out after {0:?}")]
    TimedOut(Duration),

    #[error("pipeline task failed: {0}")]
    Task(String),
}

/// Run state shared by the orchestrator task and the evidence workers
struct Recorder {
    run_id: Uuid,
    run: Mutex<PipelineRun>,
    observers: Arc<Observers>,
    cancel: CancellationToken,
    sink: Option<mpsc::Sender<Verdict>>,
}

impl Recorder {
    fn new(
        observers: Arc<Observers>,
        cancel: CancellationToken,
        sink: Option<mpsc::Sender<Verdict>>,
    ) -> Self {
        let run_id = Uuid::new_v4();
        Self {
            run_id,
            run: Mutex::new(PipelineRun::new(run_id)),
            observers,
            cancel,
            sink,
        }
    }

    fn with_run<R>(&self, f: impl FnOnce(&mut PipelineRun) -> R) -> R {
        f(&mut self.run.lock())
    }

    /// Record an event, then notify observers outside the lock
    fn emit(&self, kind: EventKind, stage: Stage, payload: Value) {
        let event = self.with_run(|run| {
            let event = StageEvent::new(run.events.len() as u64, run.id, kind, stage, payload);
            run.record(event.clone());
            event
        });
        self.observers.notify(&event);
    }

    fn transition(&self, next: RunState) {
        if let Err(e) = self.with_run(|run| run.transition(next)) {
            warn!(run_id = %self.run_id, error = %e, "Ignoring invalid run transition");
        }
    }

    fn current_stage(&self) -> Stage {
        match self.with_run(|run| run.state.clone()) {
            RunState::Idle | RunState::Detecting => Stage::Detect,
            RunState::GatheringEvidence => Stage::Evidence,
            RunState::WritingVerdicts => Stage::Verdict,
            RunState::Complete | RunState::Error { .. } => Stage::Complete,
        }
    }

    /// Terminal failure of the run
    fn fail(&self, message: String, mut payload: Value) {
        let stage = self.current_stage();
        if let Some(fields) = payload.as_object_mut() {
            fields.insert("terminal".to_string(), Value::Bool(true));
        }
        self.emit(EventKind::Error, stage, payload);
        self.transition(RunState::Error { error: message });
    }

    fn finish(&self) -> PipelineRun {
        self.with_run(|run| {
            run.stats.mark_completed();
            std::mem::replace(run, PipelineRun::new(self.run_id))
        })
    }

    async fn pause(&self, delay: Duration) -> Result<(), AgentError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(AgentError::Model(ModelError::Cancelled)),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Call a stage collaborator with bounded retry, emitting one `Error` event
/// per failed attempt. Authentication, validation and cancellation are not
/// retried.
async fn retry_stage<T, F, Fut>(
    rec: &Recorder,
    policy: &RetryPolicy,
    stage: Stage,
    context: &Value,
    mut call: F,
) -> Result<T, AgentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match call().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let mut payload = json!({
            "error": err.to_string(),
            "kind": err.kind(),
            "attempt": attempt,
        });
        if let (Some(target), Some(extra)) = (payload.as_object_mut(), context.as_object()) {
            target.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        rec.emit(EventKind::Error, stage, payload);

        let terminal = matches!(
            err.kind(),
            ErrorKind::FatalAuth | ErrorKind::Validation | ErrorKind::Cancelled
        );
        if terminal || !policy.should_retry(attempt) {
            error!(%stage, attempt, error = %err, "Stage call failed");
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(%stage, attempt, delay_ms = delay.as_millis() as u64, error = %err, "Stage call failed, retrying");
        rec.pause(delay).await?;
    }
}

/// Main fact-check orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    detector: Arc<dyn ClaimDetector>,
    hunter: Arc<dyn EvidenceHunter>,
    writer: Arc<dyn VerdictWriter>,
    config: PipelineConfig,
    observers: Arc<Observers>,
    runner: BoundedBatchRunner,
    shutdown: CancellationToken,
    active: Arc<Mutex<CancellationToken>>,
}

impl Orchestrator {
    pub fn new(
        detector: Arc<dyn ClaimDetector>,
        hunter: Arc<dyn EvidenceHunter>,
        writer: Arc<dyn VerdictWriter>,
        config: PipelineConfig,
    ) -> Self {
        let runner = BoundedBatchRunner::new(BatchConfig {
            max_concurrent: config.max_concurrent,
            item_timeout: config.evidence_timeout_seconds.map(Duration::from_secs),
        });
        let shutdown = CancellationToken::new();
        let active = Arc::new(Mutex::new(shutdown.child_token()));

        Self {
            detector,
            hunter,
            writer,
            config,
            observers: Arc::new(Observers::new()),
            runner,
            shutdown,
            active,
        }
    }

    /// Parent every run on `token`; cancelling it stops all current and future runs
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.active = Arc::new(Mutex::new(token.child_token()));
        self.shutdown = token;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    /// Observe every event
    pub fn register_observer(&self, observer: ObserverFn) -> ObserverId {
        self.observers.register(observer)
    }

    /// Observe events of one kind
    pub fn register_observer_for(&self, kind: EventKind, observer: ObserverFn) -> ObserverId {
        self.observers.register_for(kind, observer)
    }

    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.observers.unregister(id)
    }

    /// Token that stops every run, present and future
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the runs in flight; in-flight calls drain. Runs started
    /// afterwards are not affected.
    pub fn cancel(&self) {
        let mut active = self.active.lock();
        active.cancel();
        *active = self.shutdown.child_token();
    }

    /// Token for one run, linked to `caller` when given
    fn run_token(&self, caller: Option<CancellationToken>) -> CancellationToken {
        let token = self.active.lock().child_token();
        if let Some(caller) = caller {
            if caller.is_cancelled() {
                token.cancel();
                return token;
            }
            let linked = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = caller.cancelled() => linked.cancel(),
                    _ = linked.cancelled() => {}
                }
            });
        }
        token
    }

    /// Check `text` and return the verdicts in claim order
    pub async fn process(&self, text: &str) -> Result<Vec<Verdict>, PipelineError> {
        Ok(self.run(text).await?.verdicts)
    }

    /// Check `text` and return the full run record
    #[instrument(skip(self, text), fields(chars = text.len()))]
    pub async fn run(&self, text: &str) -> Result<PipelineRun, PipelineError> {
        self.execute(text, None, self.run_token(None)).await
    }

    /// Like [`run`](Self::run), stopping this run alone when `cancel` fires
    #[instrument(skip(self, text, cancel), fields(chars = text.len()))]
    pub async fn run_with_cancellation(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<PipelineRun, PipelineError> {
        self.execute(text, None, self.run_token(Some(cancel))).await
    }

    /// Check `text`, yielding each verdict as soon as it is written
    pub fn process_streaming(&self, text: impl Into<String>) -> VerdictStream {
        let (tx, rx) = mpsc::channel(16);
        let this = self.clone();
        let text = text.into();
        let cancel = self.run_token(None);
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move { this.execute(&text, Some(tx), run_cancel).await });

        VerdictStream {
            inner: ReceiverStream::new(rx),
            handle: Some(handle),
            cancel,
        }
    }

    async fn execute(
        &self,
        text: &str,
        sink: Option<mpsc::Sender<Verdict>>,
        cancel: CancellationToken,
    ) -> Result<PipelineRun, PipelineError> {
        // Ends the caller link once the run is over
        let _scope = cancel.clone().drop_guard();
        let rec = Arc::new(Recorder::new(Arc::clone(&self.observers), cancel, sink));
        info!(run_id = %rec.run_id, "Starting fact-check run");

        let timeout = self.config.run_timeout();
        match tokio::time::timeout(timeout, self.stages(text, &rec)).await {
            Ok(Ok(())) => {
                let run = rec.finish();
                info!(
                    run_id = %run.id,
                    verdicts = run.verdicts.len(),
                    total_ms = run.stats.total_processing_ms.unwrap_or(0),
                    "Fact-check run complete"
                );
                Ok(run)
            }
            Ok(Err(err)) => {
                error!(run_id = %rec.run_id, error = %err, "Fact-check run failed");
                rec.fail(err.to_string(), json!({"error": err.to_string(), "fatal": true}));
                Err(err)
            }
            Err(_) => {
                warn!(run_id = %rec.run_id, timeout_secs = timeout.as_secs(), "Fact-check run timed out");
                rec.fail(
                    "timed out".to_string(),
                    json!({"error": format!("run timed out after {:?}", timeout), "timed_out": true}),
                );
                rec.with_run(|run| run.timed_out = true);
                let run = rec.finish();
                if self.config.raise_on_error {
                    Err(PipelineError::TimedOut(timeout))
                } else {
                    Ok(run)
                }
            }
        }
    }

    async fn stages(&self, text: &str, rec: &Arc<Recorder>) -> Result<(), PipelineError> {
        let retry = self.config.stage_retry();

        rec.with_run(|run| run.stats.mark_started());
        rec.transition(RunState::Detecting);
        rec.emit(EventKind::Started, Stage::Detect, json!({"text_length": text.len()}));

        // Stage 1: detect
        let started = Instant::now();
        let detected = retry_stage(rec, &retry, Stage::Detect, &json!({}), || {
            self.detector.detect_claims(
                text,
                Some(self.config.min_check_worthiness),
                self.config.max_claims,
            )
        })
        .await;

        let detected = match detected {
            Ok(claims) => claims,
            Err(err) if err.kind() == ErrorKind::FatalAuth => {
                return Err(PipelineError::Authentication {
                    stage: Stage::Detect,
                    message: err.to_string(),
                });
            }
            Err(err) if self.config.raise_on_error => {
                return Err(PipelineError::Stage {
                    stage: Stage::Detect,
                    source: err,
                });
            }
            Err(_) => Vec::new(),
        };

        let claims = self.select_claims(rec, detected);
        rec.with_run(|run| {
            run.stats.detect_ms = Some(elapsed_ms(started));
            run.stats.claims_checked = claims.len() as u64;
        });
        let claim_ids: Vec<&str> = claims.iter().map(|c| c.id.as_str()).collect();
        rec.emit(
            EventKind::StageCompleted,
            Stage::Detect,
            json!({"claims": claims.len(), "claim_ids": claim_ids}),
        );

        if claims.is_empty() {
            info!("No claims to check");
            self.complete(rec, &[]);
            return Ok(());
        }

        // Stage 2: evidence
        rec.transition(RunState::GatheringEvidence);
        let started = Instant::now();
        let mut outcome = {
            let hunter = Arc::clone(&self.hunter);
            let worker_rec = Arc::clone(rec);
            let worker_retry = retry.clone();
            let worker = move |claim: Claim| {
                let hunter = Arc::clone(&hunter);
                let rec = Arc::clone(&worker_rec);
                let retry = worker_retry.clone();
                async move {
                    let context = json!({"claim_id": claim.id});
                    let evidence = retry_stage(&rec, &retry, Stage::Evidence, &context, || {
                        hunter.gather_evidence(&claim)
                    })
                    .await
                    .map_err(ErrorInfo::from)?;
                    rec.emit(
                        EventKind::ItemCompleted,
                        Stage::Evidence,
                        json!({"claim_id": claim.id, "evidence_count": evidence.len()}),
                    );
                    Ok::<_, ErrorInfo>(evidence)
                }
            };
            let progress: ProgressFn = Arc::new(|p: &BatchProgress| {
                debug!(
                    processed = p.processed,
                    pending = p.pending,
                    failed = p.failed,
                    eta_ms = p.estimated_time_remaining.map(|d| d.as_millis() as u64),
                    "Evidence progress"
                );
                ControlFlow::Continue(())
            });
            self.runner
                .clone()
                .with_cancellation(rec.cancel.clone())
                .run_all(claims.clone(), worker, Some(progress))
                .await
        };

        let mut ready: Vec<(Claim, Vec<Evidence>)> = Vec::with_capacity(claims.len());
        for claim in claims {
            match outcome.take(&claim.id) {
                Some(StageResult::Success(evidence)) if !evidence.is_empty() => {
                    rec.with_run(|run| run.stats.evidence_gathered += evidence.len() as u64);
                    ready.push((claim, evidence));
                }
                Some(StageResult::Success(_)) => {
                    warn!(claim_id = %claim.id, "No evidence found for claim");
                    rec.emit(
                        EventKind::Warning,
                        Stage::Evidence,
                        json!({"claim_id": claim.id, "message": "no evidence found for claim"}),
                    );
                }
                Some(StageResult::Failure(info)) if info.kind == ErrorKind::FatalAuth => {
                    return Err(PipelineError::Authentication {
                        stage: Stage::Evidence,
                        message: info.message,
                    });
                }
                Some(StageResult::Failure(info)) => {
                    warn!(claim_id = %claim.id, error = %info, "Evidence unavailable for claim");
                    rec.emit(
                        EventKind::Warning,
                        Stage::Evidence,
                        json!({"claim_id": claim.id, "message": "evidence unavailable", "error": info.message}),
                    );
                }
                Some(StageResult::Skipped(reason)) => {
                    debug!(claim_id = %claim.id, %reason, "Evidence skipped");
                }
                None => {}
            }
        }
        rec.with_run(|run| run.stats.evidence_ms = Some(elapsed_ms(started)));
        rec.emit(
            EventKind::StageCompleted,
            Stage::Evidence,
            json!({
                "claims": outcome.progress.total,
                "with_evidence": ready.len(),
                "failed": outcome.progress.failed,
                "cancelled": outcome.cancelled,
            }),
        );

        if outcome.cancelled || rec.cancel.is_cancelled() {
            self.cancelled(rec);
            return Ok(());
        }
        if ready.is_empty() {
            self.complete(rec, &[]);
            return Ok(());
        }

        // Stage 3: verdicts, in claim order
        rec.transition(RunState::WritingVerdicts);
        let started = Instant::now();
        let mut verdicts = Vec::with_capacity(ready.len());
        let mut streaming = rec.sink.is_some();
        for (claim, evidence) in &ready {
            if rec.cancel.is_cancelled() {
                self.cancelled(rec);
                return Ok(());
            }

            let context = json!({"claim_id": claim.id});
            let written = retry_stage(rec, &retry, Stage::Verdict, &context, move || async move {
                let verdict = self.writer.write_verdict(claim, evidence).await?;
                verdict.validate()?;
                Ok::<_, AgentError>(verdict)
            })
            .await;

            match written {
                Ok(verdict) => {
                    rec.with_run(|run| {
                        run.stats.verdicts_generated += 1;
                        run.verdicts.push(verdict.clone());
                    });
                    rec.emit(
                        EventKind::ItemCompleted,
                        Stage::Verdict,
                        json!({
                            "claim_id": claim.id,
                            "verdict": verdict.verdict,
                            "confidence": verdict.confidence,
                        }),
                    );
                    if let (true, Some(sink)) = (streaming, rec.sink.as_ref()) {
                        if sink.send(verdict.clone()).await.is_err() {
                            debug!(run_id = %rec.run_id, "Verdict consumer closed, no longer streaming");
                            streaming = false;
                        }
                    }
                    verdicts.push(verdict);
                }
                Err(err) if err.kind() == ErrorKind::FatalAuth => {
                    return Err(PipelineError::Authentication {
                        stage: Stage::Verdict,
                        message: err.to_string(),
                    });
                }
                Err(AgentError::Validation(e)) => {
                    warn!(claim_id = %claim.id, error = %e, "Dropping invalid verdict");
                }
                Err(err) => {
                    warn!(claim_id = %claim.id, error = %err, "Dropping claim without verdict");
                }
            }
        }
        rec.with_run(|run| run.stats.verdict_ms = Some(elapsed_ms(started)));
        rec.emit(
            EventKind::StageCompleted,
            Stage::Verdict,
            json!({"verdicts": verdicts.len()}),
        );

        self.complete(rec, &verdicts);
        Ok(())
    }

    /// Validate, filter by score, cap, and make ids unique, in that order
    fn select_claims(&self, rec: &Recorder, detected: Vec<Claim>) -> Vec<Claim> {
        rec.with_run(|run| run.stats.claims_detected = detected.len() as u64);

        let mut valid = Vec::with_capacity(detected.len());
        for claim in detected {
            match claim.validate() {
                Ok(()) => valid.push(claim),
                Err(e) => {
                    warn!(claim_id = %claim.id, error = %e, "Skipping invalid claim");
                    rec.emit(
                        EventKind::Warning,
                        Stage::Detect,
                        json!({"claim_id": claim.id, "message": "invalid claim", "error": e.to_string()}),
                    );
                }
            }
        }

        let before = valid.len();
        let mut claims: Vec<Claim> = valid
            .into_iter()
            .filter(|c| c.check_worthiness >= self.config.min_check_worthiness)
            .collect();
        if claims.len() < before {
            info!(
                dropped = before - claims.len(),
                threshold = self.config.min_check_worthiness,
                "Filtered claims below check-worthiness threshold"
            );
        }

        if let Some(max) = self.config.max_claims {
            if claims.len() > max {
                info!(from = claims.len(), to = max, "Limiting claims");
                claims.truncate(max);
            }
        }

        let mut seen = std::collections::HashSet::with_capacity(claims.len());
        for claim in &mut claims {
            if !seen.insert(claim.id.clone()) {
                let fresh = Uuid::new_v4().to_string();
                debug!(old = %claim.id, new = %fresh, "Reassigning duplicate claim id");
                claim.id = fresh.clone();
                seen.insert(fresh);
            }
        }

        claims
    }

    fn complete(&self, rec: &Recorder, verdicts: &[Verdict]) {
        rec.transition(RunState::Complete);
        rec.emit(EventKind::Completed, Stage::Complete, json!({"verdicts": verdicts}));
    }

    fn cancelled(&self, rec: &Recorder) {
        info!(run_id = %rec.run_id, "Fact-check run cancelled");
        rec.fail(
            "cancelled".to_string(),
            json!({"error": "run cancelled", "kind": ErrorKind::Cancelled}),
        );
    }
}

/// Verdicts of a streaming run, in claim order.
///
/// Dropping the stream without calling [`finish`](Self::finish) aborts the run.
pub struct VerdictStream {
    inner: ReceiverStream<Verdict>,
    handle: Option<JoinHandle<Result<PipelineRun, PipelineError>>>,
    cancel: CancellationToken,
}

impl VerdictStream {
    /// Stop this run; verdicts already written are still yielded
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run to finish and return its record.
    ///
    /// Verdicts not yet consumed are dropped.
    pub async fn finish(mut self) -> Result<PipelineRun, PipelineError> {
        self.inner.close();
        let handle = self
            .handle
            .take()
            .ok_or_else(|| PipelineError::Task("run already finished".to_string()))?;
        handle.await.map_err(|e| PipelineError::Task(e.to_string()))?
    }
}

impl Drop for VerdictStream {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Verdict stream dropped, aborting run");
            self.cancel.cancel();
            handle.abort();
        }
    }
}

impl Stream for VerdictStream {
    type Item = Verdict;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Verdict>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Stance, VerdictLabel};
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedDetector(Vec<Claim>);

    #[async_trait]
    impl ClaimDetector for FixedDetector {
        async fn detect_claims(
            &self,
            _text: &str,
            _min_score: Option<f64>,
            _max_count: Option<usize>,
        ) -> Result<Vec<Claim>, AgentError> {
            Ok(self.0.clone())
        }
    }

    struct FailingDetector {
        calls: AtomicU32,
        error: AgentError,
    }

    #[async_trait]
    impl ClaimDetector for FailingDetector {
        async fn detect_claims(
            &self,
            _text: &str,
            _min_score: Option<f64>,
            _max_count: Option<usize>,
        ) -> Result<Vec<Claim>, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(self.error.clone())
        }
    }

    struct OneSource;

    #[async_trait]
    impl EvidenceHunter for OneSource {
        async fn gather_evidence(&self, claim: &Claim) -> Result<Vec<Evidence>, AgentError> {
            Ok(vec![Evidence::new(format!("about {}", claim.text), "https://example.org")
                .with_stance(Stance::Supporting)])
        }
    }

    struct SlowSource;

    #[async_trait]
    impl EvidenceHunter for SlowSource {
        async fn gather_evidence(&self, _claim: &Claim) -> Result<Vec<Evidence>, AgentError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(Vec::new())
        }
    }

    struct EchoWriter;

    #[async_trait]
    impl VerdictWriter for EchoWriter {
        async fn write_verdict(&self, claim: &Claim, _evidence: &[Evidence]) -> Result<Verdict, AgentError> {
            Ok(Verdict::new(claim.text.clone(), VerdictLabel::True, 0.9))
        }
    }

    fn claims(n: usize) -> Vec<Claim> {
        (0..n)
            .map(|i| Claim::new(format!("claim {}", i), 0.9).with_id(format!("c{}", i)))
            .collect()
    }

    fn quick_config() -> PipelineConfig {
        PipelineConfig {
            retry_delay_ms: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_filter_then_cap() {
        let mut detected = claims(4);
        detected[1].check_worthiness = 0.2;
        let orchestrator = Orchestrator::new(
            Arc::new(FixedDetector(detected)),
            Arc::new(OneSource),
            Arc::new(EchoWriter),
            PipelineConfig {
                max_claims: Some(2),
                ..quick_config()
            },
        );

        let run = orchestrator.run("text").await.unwrap();
        let texts: Vec<_> = run.verdicts.iter().map(|v| v.claim.as_str()).collect();
        assert_eq!(texts, vec!["claim 0", "claim 2"]);
        assert_eq!(run.stats.claims_detected, 4);
        assert_eq!(run.stats.claims_checked, 2);
        assert_eq!(run.state, RunState::Complete);
    }

    #[tokio::test]
    async fn test_duplicate_claim_ids_are_reassigned() {
        let detected = vec![
            Claim::new("first", 0.9).with_id("same"),
            Claim::new("second", 0.9).with_id("same"),
        ];
        let orchestrator = Orchestrator::new(
            Arc::new(FixedDetector(detected)),
            Arc::new(OneSource),
            Arc::new(EchoWriter),
            quick_config(),
        );

        let verdicts = orchestrator.process("text").await.unwrap();
        assert_eq!(verdicts.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detect_exhaustion_degrades_to_empty() {
        let detector = Arc::new(FailingDetector {
            calls: AtomicU32::new(0),
            error: AgentError::Detection("upstream down".into()),
        });
        let orchestrator = Orchestrator::new(
            detector.clone(),
            Arc::new(OneSource),
            Arc::new(EchoWriter),
            quick_config(),
        );

        let run = orchestrator.run("text").await.unwrap();
        assert!(run.verdicts.is_empty());
        assert_eq!(detector.calls.load(Ordering::SeqCst), 2);
        assert_eq!(run.stats.errors, 2);
        assert_eq!(run.state, RunState::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detect_exhaustion_raises_when_configured() {
        let orchestrator = Orchestrator::new(
            Arc::new(FailingDetector {
                calls: AtomicU32::new(0),
                error: AgentError::Detection("upstream down".into()),
            }),
            Arc::new(OneSource),
            Arc::new(EchoWriter),
            PipelineConfig {
                raise_on_error: true,
                ..quick_config()
            },
        );

        let err = orchestrator.run("text").await.unwrap_err();
        assert!(matches!(err, PipelineError::Stage { stage: Stage::Detect, .. }));
    }

    #[tokio::test]
    async fn test_auth_failure_always_propagates() {
        let detector = Arc::new(FailingDetector {
            calls: AtomicU32::new(0),
            error: AgentError::Model(ModelError::Authentication {
                provider: "p1".into(),
                message: "invalid key".into(),
            }),
        });
        let orchestrator = Orchestrator::new(
            detector.clone(),
            Arc::new(OneSource),
            Arc::new(EchoWriter),
            quick_config(),
        );

        let err = orchestrator.run("text").await.unwrap_err();
        assert!(matches!(err, PipelineError::Authentication { stage: Stage::Detect, .. }));
        // Not retried
        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_returns_partial_run() {
        let orchestrator = Orchestrator::new(
            Arc::new(FixedDetector(claims(2))),
            Arc::new(SlowSource),
            Arc::new(EchoWriter),
            PipelineConfig {
                timeout_seconds: 5,
                ..quick_config()
            },
        );

        let run = orchestrator.run("text").await.unwrap();
        assert!(run.timed_out);
        assert!(run.verdicts.is_empty());
        assert!(matches!(run.state, RunState::Error { .. }));
        assert!(run.events.last().map(|e| e.kind) == Some(EventKind::Error));
        assert!(run.events.last().is_some_and(|e| e.is_terminal()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_raises_when_configured() {
        let orchestrator = Orchestrator::new(
            Arc::new(FixedDetector(claims(1))),
            Arc::new(SlowSource),
            Arc::new(EchoWriter),
            PipelineConfig {
                timeout_seconds: 5,
                raise_on_error: true,
                ..quick_config()
            },
        );

        let err = orchestrator.run("text").await.unwrap_err();
        assert!(matches!(err, PipelineError::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_streaming_yields_in_order() {
        let orchestrator = Orchestrator::new(
            Arc::new(FixedDetector(claims(3))),
            Arc::new(OneSource),
            Arc::new(EchoWriter),
            quick_config(),
        );

        let mut stream = orchestrator.process_streaming("text");
        let mut seen = Vec::new();
        while let Some(verdict) = stream.next().await {
            seen.push(verdict.claim);
        }
        assert_eq!(seen, vec!["claim 0", "claim 1", "claim 2"]);

        let run = stream.finish().await.unwrap();
        assert_eq!(run.verdicts.len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_evidence() {
        let orchestrator = Orchestrator::new(
            Arc::new(FixedDetector(claims(3))),
            Arc::new(OneSource),
            Arc::new(EchoWriter),
            quick_config(),
        );
        let token = CancellationToken::new();
        token.cancel();

        let run = orchestrator.run_with_cancellation("text", token).await.unwrap();
        assert!(run.verdicts.is_empty());
        assert_eq!(run.state, RunState::Error { error: "cancelled".to_string() });
        assert_eq!(run.events_of(EventKind::ItemCompleted).count(), 0);
    }

    #[tokio::test]
    async fn test_run_after_cancel_completes() {
        let orchestrator = Orchestrator::new(
            Arc::new(FixedDetector(claims(1))),
            Arc::new(OneSource),
            Arc::new(EchoWriter),
            quick_config(),
        );
        orchestrator.cancel();
        // Clients sharing the shutdown token keep working
        assert!(!orchestrator.cancellation_token().is_cancelled());

        let run = orchestrator.run("text").await.unwrap();
        assert_eq!(run.state, RunState::Complete);
        assert_eq!(run.verdicts.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_token_stops_later_runs() {
        let shutdown = CancellationToken::new();
        let orchestrator = Orchestrator::new(
            Arc::new(FixedDetector(claims(1))),
            Arc::new(OneSource),
            Arc::new(EchoWriter),
            quick_config(),
        )
        .with_cancellation(shutdown.clone());
        shutdown.cancel();

        let run = orchestrator.run("text").await.unwrap();
        assert_eq!(run.state, RunState::Error { error: "cancelled".to_string() });
    }

    struct CountingWriter(AtomicU32);

    #[async_trait]
    impl VerdictWriter for CountingWriter {
        async fn write_verdict(&self, claim: &Claim, _evidence: &[Evidence]) -> Result<Verdict, AgentError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(Verdict::new(claim.text.clone(), VerdictLabel::True, 0.9))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_stream_stops_writing_verdicts() {
        let writer = Arc::new(CountingWriter(AtomicU32::new(0)));
        let orchestrator = Orchestrator::new(
            Arc::new(FixedDetector(claims(10))),
            Arc::new(OneSource),
            writer.clone(),
            quick_config(),
        );

        let mut stream = orchestrator.process_streaming("text");
        assert!(stream.next().await.is_some());
        drop(stream);

        let written = writer.0.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(writer.0.load(Ordering::SeqCst), written);
        assert!(written < 10);
    }

    #[tokio::test]
    async fn test_stream_cancel_leaves_other_runs_alone() {
        let orchestrator = Orchestrator::new(
            Arc::new(FixedDetector(claims(2))),
            Arc::new(OneSource),
            Arc::new(EchoWriter),
            quick_config(),
        );

        let stream = orchestrator.process_streaming("first");
        stream.cancel();
        let cancelled = stream.finish().await.unwrap();
        assert!(matches!(cancelled.state, RunState::Error { .. }));

        let run = orchestrator.run("second").await.unwrap();
        assert_eq!(run.verdicts.len(), 2);
    }
}
