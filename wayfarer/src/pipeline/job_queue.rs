//! Database-backed job queue for itinerary processing.
//!
//! Thin policy layer over [`JobRepository`]: enqueue with a connect timeout,
//! retry with exponential backoff, stall recovery and retention. Workers wait
//! on [`JobQueue::notifier`] and poll as a fallback.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::database::models::{FailureDisposition, JobRecord, JobState, QueueDepth};
use crate::database::repositories::{JobRepository, StallSweep};
use crate::database::time::{duration_ms, ms_ago, now_ms};
use crate::{Error, Result};

/// Job queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueueConfig {
    /// Queue name stored on every job row.
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Budget for a broker round trip (enqueue, depth, ping), in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Attempts per job before it is terminally failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base retry delay in milliseconds, doubled on each further attempt.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_queue_name() -> String {
    "itinerary-processing".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    5_000
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            queue_name: default_queue_name(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl JobQueueConfig {
    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff_ms: u64) -> Self {
        self.max_attempts = max_attempts;
        self.backoff_ms = backoff_ms;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Job payload: a lookup-only reference to an itinerary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItineraryJob {
    pub itinerary_id: i64,
}

/// Per-job enqueue options.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    /// Higher runs first.
    pub priority: i64,
    /// Not claimable until this much time has passed.
    pub delay: Duration,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A claimed job, ready for a worker.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: String,
    pub itinerary_id: i64,
    /// 1-based attempt number of this claim.
    pub attempt: i64,
    pub max_attempts: i64,
    record: JobRecord,
}

impl QueuedJob {
    pub fn record(&self) -> &JobRecord {
        &self.record
    }
}

/// Broker health as seen by [`JobQueue::health_check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueHealth {
    Healthy,
    Unhealthy { reason: String },
}

impl QueueHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// The itinerary job queue.
pub struct JobQueue {
    config: JobQueueConfig,
    repository: Arc<dyn JobRepository>,
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn new(config: JobQueueConfig, repository: Arc<dyn JobRepository>) -> Self {
        Self {
            config,
            repository,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.config
    }

    /// Signalled whenever a job becomes claimable.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Add a job for `payload`. Any broker failure, including exceeding the
    /// connect timeout, is reported as [`Error::Enqueue`].
    pub async fn enqueue(&self, payload: ItineraryJob, opts: EnqueueOptions) -> Result<String> {
        let body = serde_json::to_string(&payload)?;
        let job = JobRecord::new(
            &self.config.queue_name,
            body,
            opts.priority,
            duration_ms(opts.delay),
            i64::from(self.config.max_attempts),
            i64::try_from(self.config.backoff_ms).unwrap_or(i64::MAX),
        );

        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, self.repository.insert(&job)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Error::enqueue(e.to_string())),
            Err(_) => {
                return Err(Error::enqueue(format!(
                    "broker did not respond within {timeout:?}"
                )));
            }
        }

        debug!(
            job_id = %job.id,
            itinerary_id = payload.itinerary_id,
            "Enqueued itinerary job"
        );

        if opts.delay.is_zero() {
            self.notify.notify_one();
        }
        Ok(job.id)
    }

    /// Claim the next ready job for `worker_id`.
    ///
    /// Jobs whose payload cannot be decoded are failed on the spot and skipped.
    pub async fn dequeue(&self, worker_id: &str) -> Result<Option<QueuedJob>> {
        loop {
            let Some(record) = self
                .repository
                .claim_next(&self.config.queue_name, worker_id)
                .await?
            else {
                return Ok(None);
            };

            match serde_json::from_str::<ItineraryJob>(&record.payload) {
                Ok(payload) => {
                    return Ok(Some(QueuedJob {
                        id: record.id.clone(),
                        itinerary_id: payload.itinerary_id,
                        attempt: record.attempts,
                        max_attempts: record.max_attempts,
                        record,
                    }));
                }
                Err(e) => {
                    warn!(job_id = %record.id, "Discarding job with malformed payload: {}", e);
                    self.repository
                        .mark_failed(&record.id, &format!("malformed payload: {e}"))
                        .await?;
                }
            }
        }
    }

    pub async fn complete(&self, job: &QueuedJob) -> Result<()> {
        if !self.repository.mark_completed(&job.id).await? {
            warn!(job_id = %job.id, "Job was no longer active when completing");
        }
        Ok(())
    }

    /// Report a failed attempt: schedule a retry with backoff, or fail the job
    /// for good once its attempts are used up.
    pub async fn fail(&self, job: &QueuedJob, error: &str) -> Result<FailureDisposition> {
        if job.record.attempts_exhausted() {
            self.repository.mark_failed(&job.id, error).await?;
            warn!(
                job_id = %job.id,
                itinerary_id = job.itinerary_id,
                attempts = job.attempt,
                "Job failed permanently: {}",
                error
            );
            return Ok(FailureDisposition::Exhausted);
        }

        let run_at = now_ms().saturating_add(job.record.retry_delay_ms());
        self.repository.schedule_retry(&job.id, error, run_at).await?;
        debug!(
            job_id = %job.id,
            attempt = job.attempt,
            delay_ms = job.record.retry_delay_ms(),
            "Job scheduled for retry"
        );
        Ok(FailureDisposition::Retrying { run_at })
    }

    /// Fail a job without further attempts.
    pub async fn discard(&self, job: &QueuedJob, error: &str) -> Result<()> {
        self.repository.mark_failed(&job.id, error).await?;
        Ok(())
    }

    /// Waiting, active and delayed counts for this queue.
    pub async fn depth(&self) -> Result<QueueDepth> {
        let timeout = self.config.connect_timeout();
        tokio::time::timeout(timeout, self.repository.depth(&self.config.queue_name))
            .await
            .map_err(|_| Error::timeout("queue depth", timeout))?
    }

    /// Ping the broker. Never errors.
    pub async fn health_check(&self) -> QueueHealth {
        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, self.repository.ping()).await {
            Ok(Ok(())) => QueueHealth::Healthy,
            Ok(Err(e)) => QueueHealth::Unhealthy {
                reason: e.to_string(),
            },
            Err(_) => QueueHealth::Unhealthy {
                reason: format!("no response within {timeout:?}"),
            },
        }
    }

    /// Return jobs whose lock is older than `stall_timeout` to the queue.
    pub async fn requeue_stalled(
        &self,
        stall_timeout: Duration,
        max_stalled_count: u32,
    ) -> Result<StallSweep> {
        let sweep = self
            .repository
            .requeue_stalled(
                &self.config.queue_name,
                ms_ago(now_ms(), stall_timeout),
                i64::from(max_stalled_count),
            )
            .await?;

        if sweep.requeued > 0 || sweep.failed > 0 {
            info!(
                requeued = sweep.requeued,
                failed = sweep.failed,
                "Recovered stalled jobs"
            );
        }
        if sweep.requeued > 0 {
            self.notify.notify_waiters();
        }
        Ok(sweep)
    }

    /// One retention pass: trim finished rows to the newest `keep_*` per state,
    /// then drop rows finished more than `retention` ago. Deletes in batches.
    pub async fn purge(
        &self,
        keep_completed: u32,
        keep_failed: u32,
        retention: Option<Duration>,
        batch_size: u32,
    ) -> Result<u64> {
        let batch = batch_size.max(1);
        let mut total = 0;

        for (state, keep) in [
            (JobState::Completed, keep_completed),
            (JobState::Failed, keep_failed),
        ] {
            loop {
                let deleted = self
                    .repository
                    .trim_finished(state.as_str(), keep, batch)
                    .await?;
                total += deleted;
                if deleted < u64::from(batch) {
                    break;
                }
            }
        }

        if let Some(retention) = retention {
            let cutoff = ms_ago(now_ms(), retention);
            loop {
                let deleted = self
                    .repository
                    .delete_finished_before(cutoff, batch)
                    .await?;
                total += deleted;
                if deleted < u64::from(batch) {
                    break;
                }
            }
        }

        Ok(total)
    }
}
