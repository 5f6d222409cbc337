//! Job queue database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// A broker-side job row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    /// Logical queue name; a single table serves every queue.
    pub queue: String,
    /// JSON payload.
    pub payload: String,
    /// WAITING, ACTIVE, COMPLETED, FAILED
    pub status: String,
    pub priority: i64,
    /// Claims so far, including the current one.
    pub attempts: i64,
    pub max_attempts: i64,
    /// Base retry delay; doubled per failed attempt.
    pub backoff_ms: i64,
    /// How many times the job was found with an expired lock.
    pub stall_count: i64,
    /// Not claimable before this instant (epoch ms).
    pub run_at: i64,
    pub locked_at: Option<i64>,
    pub worker_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub finished_at: Option<i64>,
}

impl JobRecord {
    pub fn new(
        queue: impl Into<String>,
        payload: impl Into<String>,
        priority: i64,
        delay_ms: i64,
        max_attempts: i64,
        backoff_ms: i64,
    ) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            queue: queue.into(),
            payload: payload.into(),
            status: JobState::Waiting.as_str().to_string(),
            priority,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            backoff_ms: backoff_ms.max(0),
            stall_count: 0,
            run_at: now.saturating_add(delay_ms.max(0)),
            locked_at: None,
            worker_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn state(&self) -> Option<JobState> {
        JobState::parse(&self.status)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Retry delay after the current attempt fails: `backoff * 2^(attempts-1)`.
    pub fn retry_delay_ms(&self) -> i64 {
        let exponent = (self.attempts - 1).clamp(0, 30) as u32;
        self.backoff_ms.saturating_mul(1i64 << exponent)
    }
}

/// Job broker states. A delayed job is a waiting job whose `run_at` lies ahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WAITING" => Some(Self::Waiting),
            "ACTIVE" => Some(Self::Active),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Per-state job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Ready to run now.
    pub waiting: u64,
    pub active: u64,
    /// Waiting, but scheduled for later (initial delay or retry backoff).
    pub delayed: u64,
}

/// Outcome of a failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Scheduled for another attempt at the given epoch-ms instant.
    Retrying { run_at: i64 },
    /// Attempts exhausted; the job is terminally failed.
    Exhausted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_per_attempt() {
        let mut job = JobRecord::new("q", "{}", 0, 0, 5, 1000);
        job.attempts = 1;
        assert_eq!(job.retry_delay_ms(), 1000);
        job.attempts = 2;
        assert_eq!(job.retry_delay_ms(), 2000);
        job.attempts = 4;
        assert_eq!(job.retry_delay_ms(), 8000);
    }

    #[test]
    fn new_job_is_waiting_and_clamps_limits() {
        let job = JobRecord::new("q", "{}", 0, -5, 0, -1);
        assert_eq!(job.state(), Some(JobState::Waiting));
        assert_eq!(job.max_attempts, 1);
        assert_eq!(job.backoff_ms, 0);
        assert_eq!(job.run_at, job.created_at);
    }
}
