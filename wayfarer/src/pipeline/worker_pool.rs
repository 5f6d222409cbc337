//! Worker pool consuming the itinerary job queue.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job_queue::{JobQueue, QueuedJob};
use super::processor::{ProcessingPipeline, RunOutcome};
use crate::Error;
use crate::database::models::FailureDisposition;

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Concurrent workers.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Fallback poll interval when no notification arrives, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// A job whose lock is older than this is considered stalled, in seconds.
    /// Must exceed the longest possible pipeline run.
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,

    /// How often the stall reaper runs, in seconds.
    #[serde(default = "default_stall_check_interval_secs")]
    pub stall_check_interval_secs: u64,

    /// Stalls tolerated before a job is failed outright.
    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: u32,
}

fn default_max_workers() -> usize {
    3
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_stall_timeout_secs() -> u64 {
    300
}

fn default_stall_check_interval_secs() -> u64 {
    30
}

fn default_max_stalled_count() -> u32 {
    1
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            stall_timeout_secs: default_stall_timeout_secs(),
            stall_check_interval_secs: default_stall_check_interval_secs(),
            max_stalled_count: default_max_stalled_count(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

/// A fixed set of workers that dequeue jobs and run the pipeline, plus a
/// reaper task that requeues stalled jobs.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    cancellation_token: CancellationToken,
    active_jobs: Arc<AtomicUsize>,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            cancellation_token: CancellationToken::new(),
            active_jobs: Arc::new(AtomicUsize::new(0)),
            tasks: parking_lot::Mutex::new(None),
        }
    }

    /// Spawn the workers and the stall reaper. A second call while running is a no-op.
    pub fn start(&self, queue: Arc<JobQueue>, pipeline: Arc<ProcessingPipeline>) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            warn!("Worker pool already started");
            return;
        }
        if self.cancellation_token.is_cancelled() {
            warn!("Worker pool was stopped and cannot be restarted");
            return;
        }

        let workers = self.config.max_workers.max(1);
        info!(workers, queue = %queue.config().queue_name, "Starting worker pool");

        let mut join_set = JoinSet::new();
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(10));

        for i in 0..workers {
            join_set.spawn(worker_loop(
                format!("worker-{}-{}", std::process::id(), i),
                queue.clone(),
                pipeline.clone(),
                self.cancellation_token.clone(),
                self.active_jobs.clone(),
                poll_interval,
            ));
        }

        join_set.spawn(stall_reaper(
            queue,
            self.config.clone(),
            self.cancellation_token.clone(),
        ));

        *tasks = Some(join_set);
    }

    /// Stop taking new jobs and wait for in-flight runs to finish.
    pub async fn stop(&self) {
        info!("Stopping worker pool");
        self.cancellation_token.cancel();

        let join_set = self.tasks.lock().take();
        if let Some(mut join_set) = join_set {
            while let Some(res) = join_set.join_next().await {
                if let Err(e) = res {
                    error!("Worker task ended abnormally: {}", e);
                }
            }
        }

        info!("Worker pool stopped");
    }

    /// Jobs currently being processed.
    pub fn active_count(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some() && !self.cancellation_token.is_cancelled()
    }
}

async fn worker_loop(
    worker_id: String,
    queue: Arc<JobQueue>,
    pipeline: Arc<ProcessingPipeline>,
    cancellation_token: CancellationToken,
    active_jobs: Arc<AtomicUsize>,
    poll_interval: Duration,
) {
    let notifier = queue.notifier();
    debug!(worker = %worker_id, "Worker started");

    // Skip the wait right after a job so a backlog drains without poll delays.
    let mut drained = true;

    loop {
        if cancellation_token.is_cancelled() {
            break;
        }

        if drained {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = notifier.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        let job = match queue.dequeue(&worker_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                drained = true;
                continue;
            }
            Err(e) => {
                error!(worker = %worker_id, "Error dequeuing job: {}", e);
                drained = true;
                continue;
            }
        };
        drained = false;

        active_jobs.fetch_add(1, Ordering::SeqCst);
        process_job(&queue, &pipeline, &job).await;
        active_jobs.fetch_sub(1, Ordering::SeqCst);
    }

    debug!(worker = %worker_id, "Worker shutting down");
}

async fn process_job(queue: &JobQueue, pipeline: &ProcessingPipeline, job: &QueuedJob) {
    debug!(
        job_id = %job.id,
        itinerary_id = job.itinerary_id,
        attempt = job.attempt,
        "Processing job"
    );

    let report = match pipeline.run_guarded(job.itinerary_id).await {
        Ok(RunOutcome::Completed) | Ok(RunOutcome::ClaimLost) => queue.complete(job).await,
        Ok(RunOutcome::Failed { reason }) => queue.fail(job, &reason).await.map(log_disposition),
        Err(e) if e.is_fatal() => {
            error!(
                job_id = %job.id,
                itinerary_id = job.itinerary_id,
                "Discarding job: {}",
                e
            );
            queue.discard(job, &e.to_string()).await
        }
        Err(e) => queue.fail(job, &e.to_string()).await.map(log_disposition),
    };

    if let Err(e) = report {
        // The lock expires and the reaper hands the job out again.
        error!(job_id = %job.id, "Failed to report job result: {}", e);
    }
}

fn log_disposition(disposition: FailureDisposition) {
    if let FailureDisposition::Retrying { run_at } = disposition {
        debug!(run_at, "Job will be retried");
    }
}

async fn stall_reaper(
    queue: Arc<JobQueue>,
    config: WorkerPoolConfig,
    cancellation_token: CancellationToken,
) {
    let period = Duration::from_secs(config.stall_check_interval_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = queue
                    .requeue_stalled(config.stall_timeout(), config.max_stalled_count)
                    .await
                {
                    match e {
                        Error::DatabaseSqlx(_) | Error::Timeout { .. } => {
                            warn!("Stall sweep failed: {}", e)
                        }
                        other => error!("Stall sweep failed: {}", other),
                    }
                }
            }
        }
    }
}
