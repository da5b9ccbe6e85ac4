//! Bounded-concurrency fan-out with progress reporting.
//!
//! [`BoundedBatchRunner::run_all`] applies an async worker to every item with
//! at most `max_concurrent` invocations in flight. Each item ends up with
//! exactly one [`StageResult`], keyed by its identifier; a failing or
//! panicking worker becomes a `Failure` and never touches its siblings.
//!
//! Cancellation is cooperative. Once the token fires (or the progress
//! callback returns `ControlFlow::Break`) no new permits are taken, work
//! already in flight is allowed to finish, and the items that never started
//! are recorded as `Skipped`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{ErrorInfo, ErrorKind, StageResult, WorkItem};

/// Progress callback. Returning `Break` stops the batch like a cancellation.
pub type ProgressFn = Arc<dyn Fn(&BatchProgress) -> ControlFlow<()> + Send + Sync>;

/// Reason recorded for items that never started
pub const CANCELLED_REASON: &str = "cancelled";

/// Snapshot of batch progress
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchProgress {
    pub total: usize,
    pub processed: usize,
    pub pending: usize,
    pub failed: usize,

    /// Share of processed items that succeeded (0.0 - 1.0)
    pub success_rate: f64,

    pub avg_processing_time: Option<Duration>,

    /// Average time per completed item times pending items
    pub estimated_time_remaining: Option<Duration>,
}

#[derive(Debug)]
struct ProgressTracker {
    total: usize,
    processed: usize,
    failed: usize,
    elapsed: Duration,
}

impl ProgressTracker {
    fn new(total: usize) -> Self {
        Self {
            total,
            processed: 0,
            failed: 0,
            elapsed: Duration::ZERO,
        }
    }

    fn record(&mut self, failed: bool, elapsed: Duration) {
        self.processed += 1;
        if failed {
            self.failed += 1;
        }
        self.elapsed += elapsed;
    }

    fn snapshot(&self) -> BatchProgress {
        let pending = self.total.saturating_sub(self.processed);
        let success_rate = if self.processed == 0 {
            0.0
        } else {
            (self.processed - self.failed) as f64 / self.processed as f64
        };
        let avg = (self.processed > 0).then(|| self.elapsed / self.processed as u32);

        BatchProgress {
            total: self.total,
            processed: self.processed,
            pending,
            failed: self.failed,
            success_rate,
            avg_processing_time: avg,
            estimated_time_remaining: avg.map(|a| a * pending as u32),
        }
    }
}

/// Runner settings
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Worker ceiling; values below 1 are treated as 1
    pub max_concurrent: usize,

    /// Per-item timeout; an expired item fails with a retryable error
    pub item_timeout: Option<Duration>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            item_timeout: None,
        }
    }
}

/// Results of one batch
#[derive(Debug)]
pub struct BatchOutcome<R> {
    /// One result per unique item id
    pub results: HashMap<String, StageResult<R>>,

    /// Final progress snapshot
    pub progress: BatchProgress,

    /// Whether the batch stopped early
    pub cancelled: bool,
}

impl<R> BatchOutcome<R> {
    pub fn get(&self, id: &str) -> Option<&StageResult<R>> {
        self.results.get(id)
    }

    pub fn take(&mut self, id: &str) -> Option<StageResult<R>> {
        self.results.remove(id)
    }

    pub fn success_count(&self) -> usize {
        self.results.values().filter(|r| r.is_success()).count()
    }
}

/// Fans items out to a worker under a concurrency ceiling
#[derive(Debug, Clone)]
pub struct BoundedBatchRunner {
    config: BatchConfig,
    cancel: CancellationToken,
}

impl BoundedBatchRunner {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Share a cancellation token with other components
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop issuing permits for every batch sharing this token
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Run `worker` over every item and wait for all of them
    #[instrument(skip_all, fields(items = items.len(), max_concurrent = self.config.max_concurrent))]
    pub async fn run_all<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        worker: F,
        on_progress: Option<ProgressFn>,
    ) -> BatchOutcome<R>
    where
        T: WorkItem + Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ErrorInfo>> + Send + 'static,
    {
        let mut seen = HashSet::with_capacity(items.len());
        let mut queue = VecDeque::with_capacity(items.len());
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let id = item.item_id().to_string();
            if seen.insert(id.clone()) {
                ids.push(id);
                queue.push_back(item);
            } else {
                warn!(item_id = %id, "Duplicate item id in batch, skipping");
            }
        }

        let worker = Arc::new(worker);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut join_set: JoinSet<(String, StageResult<R>, Duration)> = JoinSet::new();
        let mut results: HashMap<String, StageResult<R>> = HashMap::with_capacity(ids.len());
        let mut tracker = ProgressTracker::new(ids.len());
        let mut cancelled = false;

        loop {
            if join_set.is_empty() && (cancelled || queue.is_empty()) {
                break;
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled(), if !cancelled => {
                    info!(in_flight = join_set.len(), "Batch cancelled, draining in-flight work");
                    cancelled = true;
                }

                Some(joined) = join_set.join_next(), if !join_set.is_empty() => {
                    match joined {
                        Ok((id, result, elapsed)) => {
                            tracker.record(result.is_failure(), elapsed);
                            if let StageResult::Failure(ref info) = result {
                                debug!(item_id = %id, error = %info, "Batch item failed");
                            }
                            results.insert(id, result);
                        }
                        Err(e) => {
                            error!(error = %e, "Batch worker task failed");
                            tracker.record(true, Duration::ZERO);
                        }
                    }

                    if let Some(ref callback) = on_progress {
                        if notify_progress(callback, &tracker.snapshot()).is_break() && !cancelled {
                            info!("Batch stopped by progress callback");
                            cancelled = true;
                        }
                    }
                }

                permit = Arc::clone(&semaphore).acquire_owned(), if !cancelled && !queue.is_empty() => {
                    let (Ok(permit), Some(item)) = (permit, queue.pop_front()) else {
                        cancelled = true;
                        continue;
                    };
                    let id = item.item_id().to_string();
                    let worker = Arc::clone(&worker);
                    let timeout = self.config.item_timeout;

                    join_set.spawn(async move {
                        let _permit = permit;
                        let started = Instant::now();
                        let work = AssertUnwindSafe(async move {
                            match timeout {
                                Some(limit) => tokio::time::timeout(limit, worker(item))
                                    .await
                                    .unwrap_or_else(|_| {
                                        Err(ErrorInfo::new(
                                            ErrorKind::Retryable,
                                            format!("item timed out after {:?}", limit),
                                        ))
                                    }),
                                None => worker(item).await,
                            }
                        });
                        let result = match work.catch_unwind().await {
                            Ok(Ok(value)) => StageResult::Success(value),
                            Ok(Err(info)) => StageResult::Failure(info),
                            Err(panic) => StageResult::Failure(ErrorInfo::unexpected(format!(
                                "worker panicked: {}",
                                panic_message(panic.as_ref())
                            ))),
                        };
                        (id, result, started.elapsed())
                    });
                }

                else => break,
            }
        }

        for item in queue {
            results.insert(
                item.item_id().to_string(),
                StageResult::Skipped(CANCELLED_REASON.to_string()),
            );
        }
        for id in &ids {
            results
                .entry(id.clone())
                .or_insert_with(|| StageResult::Failure(ErrorInfo::unexpected("worker task did not complete")));
        }

        let progress = tracker.snapshot();
        debug!(
            processed = progress.processed,
            failed = progress.failed,
            cancelled,
            "Batch finished"
        );

        BatchOutcome {
            results,
            progress,
            cancelled,
        }
    }
}

/// Run a batch with a fresh runner
pub async fn run_all<T, R, F, Fut>(
    items: Vec<T>,
    worker: F,
    max_concurrent: usize,
    on_progress: Option<ProgressFn>,
) -> BatchOutcome<R>
where
    T: WorkItem + Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, ErrorInfo>> + Send + 'static,
{
    BoundedBatchRunner::new(BatchConfig {
        max_concurrent,
        item_timeout: None,
    })
    .run_all(items, worker, on_progress)
    .await
}

fn notify_progress(callback: &ProgressFn, progress: &BatchProgress) -> ControlFlow<()> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| callback(progress))) {
        Ok(flow) => flow,
        Err(panic) => {
            error!(error = %panic_message(panic.as_ref()), "Progress callback panicked");
            ControlFlow::Continue(())
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("item-{}", i)).collect()
    }

    #[tokio::test]
    async fn test_failures_are_contained() {
        let outcome = run_all(
            ids(6),
            |id: String| async move {
                match id.as_str() {
                    "item-1" => Err(ErrorInfo::new(ErrorKind::Validation, "bad item")),
                    "item-4" => panic!("worker blew up"),
                    _ => Ok(id.len()),
                }
            },
            2,
            None,
        )
        .await;

        assert_eq!(outcome.results.len(), 6);
        assert_eq!(outcome.success_count(), 4);
        assert_eq!(
            outcome.get("item-1").and_then(|r| r.error()).map(|e| e.kind),
            Some(ErrorKind::Validation)
        );
        let panicked = outcome.get("item-4").and_then(|r| r.error()).unwrap();
        assert!(panicked.message.contains("worker blew up"));
        assert_eq!(outcome.progress.failed, 2);
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn test_duplicate_ids_run_once() {
        let items = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        let outcome = run_all(items, |id: String| async move { Ok::<_, ErrorInfo>(id) }, 4, None).await;
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.progress.total, 2);
    }

    #[tokio::test]
    async fn test_progress_snapshots() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ProgressFn = Arc::new(move |p: &BatchProgress| {
            sink.lock().push(p.clone());
            ControlFlow::Continue(())
        });

        run_all(ids(4), |id: String| async move { Ok::<_, ErrorInfo>(id) }, 1, Some(callback)).await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0].processed, 1);
        assert_eq!(seen[0].pending, 3);
        assert_eq!(seen[3].pending, 0);
        assert_eq!(seen[3].success_rate, 1.0);
        assert_eq!(seen[3].estimated_time_remaining, Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_progress_break_skips_remaining() {
        let callback: ProgressFn = Arc::new(|p: &BatchProgress| {
            if p.processed >= 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        let outcome = run_all(ids(10), |id: String| async move { Ok::<_, ErrorInfo>(id) }, 1, Some(callback)).await;

        assert!(outcome.cancelled);
        assert_eq!(outcome.results.len(), 10);
        assert_eq!(outcome.success_count(), 2);
        assert!(outcome.results.values().filter(|r| r.is_skipped()).count() == 8);
    }

    #[tokio::test]
    async fn test_panicking_callback_is_ignored() {
        let callback: ProgressFn = Arc::new(|_: &BatchProgress| panic!("observer bug"));
        let outcome = run_all(ids(3), |id: String| async move { Ok::<_, ErrorInfo>(id) }, 2, Some(callback)).await;
        assert_eq!(outcome.success_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_timeout() {
        let runner = BoundedBatchRunner::new(BatchConfig {
            max_concurrent: 2,
            item_timeout: Some(Duration::from_secs(1)),
        });

        let outcome = runner
            .run_all(
                ids(2),
                |id: String| async move {
                    if id == "item-0" {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok::<_, ErrorInfo>(id)
                },
                None,
            )
            .await;

        assert_eq!(
            outcome.get("item-0").and_then(|r| r.error()).map(|e| e.kind),
            Some(ErrorKind::Retryable)
        );
        assert!(outcome.get("item-1").unwrap().is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_drains_in_flight() {
        let runner = BoundedBatchRunner::new(BatchConfig {
            max_concurrent: 2,
            item_timeout: None,
        });
        let token = runner.cancellation_token();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let outcome = runner
            .run_all(
                ids(6),
                |id: String| async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, ErrorInfo>(id)
                },
                None,
            )
            .await;

        assert!(outcome.cancelled);
        // The first two were in flight and finished
        assert_eq!(outcome.success_count(), 2);
        assert_eq!(outcome.results.values().filter(|r| r.is_skipped()).count(), 4);
    }
}
