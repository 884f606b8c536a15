//! # acp-scheduler
//!
//! Bounded hybrid pool for message-handler invocations. A fixed set of
//! workers each owns a bounded queue and runs up to `max_tasks_per_worker`
//! handler invocations concurrently. Submission picks the three
//! least-loaded workers, skips queues at ≥90% capacity, and retries with
//! short backoff before counting the message as rejected. Either a message
//! lands on exactly one worker's queue or the rejected counter strictly
//! increases.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use acp_core::config::SchedulerConfig;
use acp_core::errors::SchedulerError;
use acp_core::retry::backoff_delay;

/// A handler invocation; resolves to whether the handler succeeded.
pub type HandlerTask = Pin<Box<dyn Future<Output = bool> + Send + 'static>>;

/// Candidate workers tried per submission attempt.
const CANDIDATES_PER_ATTEMPT: usize = 3;
/// Queue usage ratio above which a worker is skipped.
const QUEUE_SKIP_RATIO: f64 = 0.9;
/// Grace period for cancelling a timed-out handler.
const CANCEL_GRACE: Duration = Duration::from_secs(1);
/// Bounded wait for in-flight tasks during shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

/// Global scheduler counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Submissions attempted.
    pub total_messages: u64,
    /// Handler invocations that completed successfully.
    pub total_processed: u64,
    /// Handler invocations that failed or timed out.
    pub total_errors: u64,
    /// Messages that could not be placed or ran into worker limits.
    pub total_rejected: u64,
}

/// Stats snapshot plus live worker load.
#[derive(Clone, Debug)]
pub struct SchedulerSnapshot {
    /// Global counters.
    pub stats: SchedulerStats,
    /// Worker count.
    pub active_workers: usize,
    /// In-flight handler invocations per worker.
    pub worker_tasks: Vec<usize>,
}

struct Worker {
    tx: mpsc::Sender<HandlerTask>,
    active: Arc<AtomicUsize>,
}

/// Bounded worker-pool scheduler.
pub struct MessageScheduler {
    config: SchedulerConfig,
    handler_timeout: Duration,
    workers: Vec<Worker>,
    stats: Arc<Mutex<SchedulerStats>>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageScheduler {
    /// Start `config.core_workers` workers immediately.
    #[must_use]
    pub fn new(config: SchedulerConfig, handler_timeout: Duration) -> Self {
        let stats = Arc::new(Mutex::new(SchedulerStats::default()));
        let running = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let mut workers = Vec::with_capacity(config.core_workers);
        let mut handles = Vec::with_capacity(config.core_workers);
        for worker_id in 0..config.core_workers {
            let (tx, rx) = mpsc::channel(config.worker_queue_size);
            let active = Arc::new(AtomicUsize::new(0));
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                rx,
                active.clone(),
                stats.clone(),
                running.clone(),
                cancel.clone(),
                config.max_tasks_per_worker,
                handler_timeout,
            )));
            workers.push(Worker { tx, active });
        }
        info!(
            core_workers = config.core_workers,
            max_workers = config.max_workers,
            max_tasks_per_worker = config.max_tasks_per_worker,
            "scheduler started"
        );
        Self {
            config,
            handler_timeout,
            workers,
            stats,
            running,
            cancel,
            handles: Mutex::new(handles),
        }
    }

    /// Configured per-handler timeout.
    #[must_use]
    pub fn handler_timeout(&self) -> Duration {
        self.handler_timeout
    }

    /// Whether the pool still accepts submissions.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Submit a handler invocation.
    ///
    /// Tries the three least-loaded workers (skipping near-full queues)
    /// with a bounded queue put; the whole selection retries with
    /// exponential backoff before the message counts as rejected.
    pub async fn submit(&self, task: HandlerTask) -> Result<(), SchedulerError> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(SchedulerError::shutdown());
        }
        self.stats.lock().total_messages += 1;

        let mut task = Some(task);
        for attempt in 0..self.config.max_submit_retries {
            let candidates = self.least_loaded(CANDIDATES_PER_ATTEMPT);
            if candidates.is_empty() {
                self.stats.lock().total_rejected += 1;
                return Err(SchedulerError::rejected("no workers available"));
            }

            for worker_id in candidates {
                let worker = &self.workers[worker_id];
                if queue_usage(worker, self.config.worker_queue_size) >= QUEUE_SKIP_RATIO {
                    warn!(worker_id, "worker queue near capacity, trying next");
                    continue;
                }
                let payload = task.take().expect("task present until placed");
                match worker
                    .tx
                    .send_timeout(payload, self.config.queue_timeout())
                    .await
                {
                    Ok(()) => {
                        debug!(worker_id, "task placed");
                        return Ok(());
                    }
                    Err(SendTimeoutError::Timeout(returned)
                    | SendTimeoutError::Closed(returned)) => {
                        debug!(worker_id, "queue put failed, trying next");
                        task = Some(returned);
                    }
                }
            }

            if attempt + 1 < self.config.max_submit_retries {
                let wait = backoff_delay(
                    attempt,
                    Duration::from_millis(50),
                    2.0,
                    Duration::from_millis(200),
                );
                warn!(attempt = attempt + 1, ?wait, "submit retrying");
                tokio::time::sleep(wait).await;
            }
        }

        self.stats.lock().total_rejected += 1;
        error!("submission failed after all retries");
        Err(SchedulerError::rejected("all candidate workers refused"))
    }

    fn least_loaded(&self, count: usize) -> Vec<usize> {
        let mut loads: Vec<(usize, usize)> = self
            .workers
            .iter()
            .enumerate()
            .map(|(id, w)| (id, w.active.load(Ordering::Relaxed)))
            .collect();
        loads.sort_by_key(|(_, load)| *load);
        loads.into_iter().take(count).map(|(id, _)| id).collect()
    }

    /// Current counters and per-worker load.
    #[must_use]
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            stats: *self.stats.lock(),
            active_workers: self.workers.len(),
            worker_tasks: self
                .workers
                .iter()
                .map(|w| w.active.load(Ordering::Relaxed))
                .collect(),
        }
    }

    /// Total in-flight handler invocations.
    #[must_use]
    pub fn total_active_tasks(&self) -> usize {
        self.workers
            .iter()
            .map(|w| w.active.load(Ordering::Relaxed))
            .sum()
    }

    /// Stop the pool.
    ///
    /// With `wait`, in-flight tasks get up to ten seconds to drain before
    /// the workers are cancelled.
    pub async fn shutdown(&self, wait: bool) {
        info!("scheduler shutting down");
        self.running.store(false, Ordering::SeqCst);

        if wait {
            let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN;
            while self.total_active_tasks() > 0 && tokio::time::Instant::now() < deadline {
                debug!(remaining = self.total_active_tasks(), "waiting for tasks");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let aborter = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
                aborter.abort();
            }
        }

        let stats = *self.stats.lock();
        info!(
            messages = stats.total_messages,
            processed = stats.total_processed,
            errors = stats.total_errors,
            rejected = stats.total_rejected,
            "scheduler stopped"
        );
    }
}

fn queue_usage(worker: &Worker, capacity: usize) -> f64 {
    if capacity == 0 {
        return 1.0;
    }
    let free = worker.tx.capacity();
    #[allow(clippy::cast_precision_loss)]
    {
        (capacity.saturating_sub(free)) as f64 / capacity as f64
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    mut rx: mpsc::Receiver<HandlerTask>,
    active: Arc<AtomicUsize>,
    stats: Arc<Mutex<SchedulerStats>>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    max_tasks: usize,
    handler_timeout: Duration,
) {
    debug!(worker_id, "worker started");
    loop {
        let task = tokio::select! {
            task = rx.recv() => task,
            () = cancel.cancelled() => break,
        };
        let Some(task) = task else { break };
        if !running.load(Ordering::Relaxed) {
            break;
        }

        if active.load(Ordering::Relaxed) >= max_tasks {
            // Over the concurrency cap: count rejected and move on. The
            // task is NOT re-queued; the submitter's retry logic already
            // spreads load across workers.
            stats.lock().total_rejected += 1;
            warn!(worker_id, max_tasks, "worker at task limit, rejecting");
            tokio::time::sleep(Duration::from_millis(50)).await;
            continue;
        }

        let _ = active.fetch_add(1, Ordering::SeqCst);
        let active2 = active.clone();
        let stats2 = stats.clone();
        let _ = tokio::spawn(async move {
            let invocation = tokio::spawn(task);
            let aborter = invocation.abort_handle();
            let success = match tokio::time::timeout(handler_timeout, invocation).await {
                Ok(Ok(success)) => success,
                Ok(Err(join_error)) => {
                    error!(worker_id, error = %join_error, "handler task panicked");
                    false
                }
                Err(_) => {
                    warn!(worker_id, "handler timed out, cancelling");
                    aborter.abort();
                    tokio::time::sleep(CANCEL_GRACE).await;
                    false
                }
            };
            {
                let mut stats = stats2.lock();
                if success {
                    stats.total_processed += 1;
                } else {
                    stats.total_errors += 1;
                }
            }
            let _ = active2.fetch_sub(1, Ordering::SeqCst);
        });
    }
    debug!(worker_id, "worker stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(workers: usize, queue: usize, max_tasks: usize) -> SchedulerConfig {
        SchedulerConfig {
            core_workers: workers,
            max_workers: workers,
            max_tasks_per_worker: max_tasks,
            worker_queue_size: queue,
            max_submit_retries: 2,
            queue_timeout_secs: 0,
        }
    }

    fn ok_task() -> HandlerTask {
        Box::pin(async { true })
    }

    fn slow_task(millis: u64) -> HandlerTask {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            true
        })
    }

    #[tokio::test]
    async fn submit_and_process() {
        let scheduler = MessageScheduler::new(small_config(2, 10, 4), Duration::from_secs(5));
        for _ in 0..5 {
            scheduler.submit(ok_task()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.stats.total_messages, 5);
        assert_eq!(snapshot.stats.total_processed, 5);
        assert_eq!(snapshot.stats.total_errors, 0);
        assert_eq!(snapshot.active_workers, 2);
        scheduler.shutdown(true).await;
    }

    #[tokio::test]
    async fn failed_handler_counts_error() {
        let scheduler = MessageScheduler::new(small_config(1, 10, 4), Duration::from_secs(5));
        scheduler.submit(Box::pin(async { false })).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.snapshot().stats.total_errors, 1);
        scheduler.shutdown(false).await;
    }

    #[tokio::test]
    async fn handler_timeout_counts_error() {
        let scheduler = MessageScheduler::new(small_config(1, 10, 4), Duration::from_millis(50));
        scheduler.submit(slow_task(5_000)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(scheduler.snapshot().stats.total_errors, 1);
        assert_eq!(scheduler.total_active_tasks(), 0);
        scheduler.shutdown(false).await;
    }

    #[tokio::test]
    async fn no_workers_means_rejection() {
        // With no workers to place on, a submission must strictly increase
        // the rejected counter and fail.
        let scheduler = MessageScheduler::new(small_config(0, 1, 1), Duration::from_secs(5));
        let err = scheduler.submit(ok_task()).await.unwrap_err();
        assert_eq!(err.code, "SCHEDULER_REJECTED");
        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.stats.total_messages, 1);
        assert_eq!(snapshot.stats.total_rejected, 1);
        scheduler.shutdown(false).await;
    }

    #[tokio::test]
    async fn worker_concurrency_capped() {
        let scheduler = MessageScheduler::new(small_config(1, 10, 2), Duration::from_secs(30));
        for _ in 0..2 {
            scheduler.submit(slow_task(500)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(scheduler.total_active_tasks() <= 2);

        // A third long task gets popped but rejected at the cap.
        scheduler.submit(slow_task(500)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(scheduler.total_active_tasks() <= 2);
        assert!(scheduler.snapshot().stats.total_rejected >= 1);
        scheduler.shutdown(false).await;
    }

    #[tokio::test]
    async fn submit_after_shutdown_fails() {
        let scheduler = MessageScheduler::new(small_config(1, 4, 2), Duration::from_secs(5));
        scheduler.shutdown(false).await;
        let err = scheduler.submit(ok_task()).await.unwrap_err();
        assert_eq!(err.code, "SCHEDULER_SHUTDOWN");
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight() {
        let scheduler = MessageScheduler::new(small_config(1, 4, 2), Duration::from_secs(5));
        scheduler.submit(slow_task(200)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.shutdown(true).await;
        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.stats.total_processed, 1);
    }

    #[tokio::test]
    async fn least_loaded_prefers_idle_workers() {
        let scheduler = MessageScheduler::new(small_config(3, 10, 4), Duration::from_secs(5));
        scheduler.workers[0].active.store(5, Ordering::Relaxed);
        scheduler.workers[2].active.store(2, Ordering::Relaxed);
        let order = scheduler.least_loaded(3);
        assert_eq!(order[0], 1);
        assert_eq!(order[1], 2);
        assert_eq!(order[2], 0);
        scheduler.shutdown(false).await;
    }
}
