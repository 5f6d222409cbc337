//! Job broker repository.
//!
//! The `job` table is an at-least-once queue: claiming flips a row to ACTIVE
//! and stamps a lock, and a worker that dies mid-job leaves the lock to
//! expire so [`JobRepository::requeue_stalled`] can hand the job out again.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{JobRecord, QueueDepth};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;

/// Counts from one stall sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StallSweep {
    pub requeued: u64,
    pub failed: u64,
}

/// Job broker operations.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn insert(&self, job: &JobRecord) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<JobRecord>>;

    /// Claim the next ready job on `queue`: highest priority, then oldest.
    async fn claim_next(&self, queue: &str, worker_id: &str) -> Result<Option<JobRecord>>;

    async fn mark_completed(&self, id: &str) -> Result<bool>;

    /// Put an ACTIVE job back to WAITING, runnable at `run_at`.
    async fn schedule_retry(&self, id: &str, error: &str, run_at: i64) -> Result<bool>;

    /// Terminally fail an ACTIVE job.
    async fn mark_failed(&self, id: &str, error: &str) -> Result<bool>;

    async fn depth(&self, queue: &str) -> Result<QueueDepth>;

    /// Return ACTIVE jobs locked before `locked_before` to WAITING, failing
    /// those that already stalled `max_stalled` times.
    async fn requeue_stalled(
        &self,
        queue: &str,
        locked_before: i64,
        max_stalled: i64,
    ) -> Result<StallSweep>;

    /// Delete up to `batch` COMPLETED or FAILED rows beyond the newest `keep`.
    async fn trim_finished(&self, status: &str, keep: u32, batch: u32) -> Result<u64>;

    /// Delete up to `batch` finished rows whose `finished_at` precedes `cutoff`.
    async fn delete_finished_before(&self, cutoff: i64, batch: u32) -> Result<u64>;

    async fn ping(&self) -> Result<()>;
}

/// SQLx implementation of [`JobRepository`].
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn insert(&self, job: &JobRecord) -> Result<()> {
        let pool = &self.pool;
        retry_on_sqlite_busy("job.insert", || async move {
            sqlx::query(
                r#"
                INSERT INTO job (
                    id, queue, payload, status, priority, attempts, max_attempts,
                    backoff_ms, stall_count, run_at, locked_at, worker_id, last_error,
                    created_at, updated_at, finished_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&job.id)
            .bind(&job.queue)
            .bind(&job.payload)
            .bind(&job.status)
            .bind(job.priority)
            .bind(job.attempts)
            .bind(job.max_attempts)
            .bind(job.backoff_ms)
            .bind(job.stall_count)
            .bind(job.run_at)
            .bind(job.locked_at)
            .bind(&job.worker_id)
            .bind(&job.last_error)
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(job.finished_at)
            .execute(pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        let job = sqlx::query_as::<_, JobRecord>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn claim_next(&self, queue: &str, worker_id: &str) -> Result<Option<JobRecord>> {
        let pool = &self.pool;
        retry_on_sqlite_busy("job.claim_next", || async move {
            let now = now_ms();
            // The outer status check makes the claim a no-op if another
            // connection took the row between the subquery and the update.
            let job = sqlx::query_as::<_, JobRecord>(
                r#"
                UPDATE job
                SET status = 'ACTIVE', attempts = attempts + 1,
                    locked_at = ?, worker_id = ?, updated_at = ?
                WHERE id = (
                    SELECT id FROM job
                    WHERE queue = ? AND status = 'WAITING' AND run_at <= ?
                    ORDER BY priority DESC, created_at ASC
                    LIMIT 1
                )
                AND status = 'WAITING'
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(worker_id)
            .bind(now)
            .bind(queue)
            .bind(now)
            .fetch_optional(pool)
            .await?;
            Ok(job)
        })
        .await
    }

    async fn mark_completed(&self, id: &str) -> Result<bool> {
        let pool = &self.pool;
        retry_on_sqlite_busy("job.mark_completed", || async move {
            let now = now_ms();
            let result = sqlx::query(
                "UPDATE job SET status = 'COMPLETED', finished_at = ?, updated_at = ?, \
                 locked_at = NULL WHERE id = ? AND status = 'ACTIVE'",
            )
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn schedule_retry(&self, id: &str, error: &str, run_at: i64) -> Result<bool> {
        let pool = &self.pool;
        retry_on_sqlite_busy("job.schedule_retry", || async move {
            let result = sqlx::query(
                r#"
                UPDATE job
                SET status = 'WAITING', run_at = ?, last_error = ?,
                    locked_at = NULL, worker_id = NULL, updated_at = ?
                WHERE id = ? AND status = 'ACTIVE'
                "#,
            )
            .bind(run_at)
            .bind(error)
            .bind(now_ms())
            .bind(id)
            .execute(pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<bool> {
        let pool = &self.pool;
        retry_on_sqlite_busy("job.mark_failed", || async move {
            let now = now_ms();
            let result = sqlx::query(
                r#"
                UPDATE job
                SET status = 'FAILED', last_error = ?, finished_at = ?,
                    locked_at = NULL, updated_at = ?
                WHERE id = ? AND status = 'ACTIVE'
                "#,
            )
            .bind(error)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let (waiting, active, delayed): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'WAITING' AND run_at <= ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'ACTIVE' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'WAITING' AND run_at > ?1 THEN 1 ELSE 0 END), 0)
            FROM job
            WHERE queue = ?2
            "#,
        )
        .bind(now_ms())
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueDepth {
            waiting: waiting.max(0) as u64,
            active: active.max(0) as u64,
            delayed: delayed.max(0) as u64,
        })
    }

    async fn requeue_stalled(
        &self,
        queue: &str,
        locked_before: i64,
        max_stalled: i64,
    ) -> Result<StallSweep> {
        let pool = &self.pool;
        retry_on_sqlite_busy("job.requeue_stalled", || async move {
            let now = now_ms();
            let mut tx = pool.begin().await?;

            let failed = sqlx::query(
                r#"
                UPDATE job
                SET status = 'FAILED', stall_count = stall_count + 1,
                    last_error = 'job stalled more than allowable limit',
                    finished_at = ?, locked_at = NULL, updated_at = ?
                WHERE queue = ? AND status = 'ACTIVE' AND locked_at < ?
                  AND stall_count + 1 > ?
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(queue)
            .bind(locked_before)
            .bind(max_stalled)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            let requeued = sqlx::query(
                r#"
                UPDATE job
                SET status = 'WAITING', stall_count = stall_count + 1, run_at = ?,
                    locked_at = NULL, worker_id = NULL, updated_at = ?
                WHERE queue = ? AND status = 'ACTIVE' AND locked_at < ?
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(queue)
            .bind(locked_before)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            tx.commit().await?;
            Ok(StallSweep { requeued, failed })
        })
        .await
    }

    async fn trim_finished(&self, status: &str, keep: u32, batch: u32) -> Result<u64> {
        let pool = &self.pool;
        retry_on_sqlite_busy("job.trim_finished", || async move {
            let result = sqlx::query(
                r#"
                DELETE FROM job WHERE id IN (
                    SELECT id FROM job
                    WHERE status = ?
                    ORDER BY finished_at DESC, created_at DESC
                    LIMIT ? OFFSET ?
                )
                "#,
            )
            .bind(status)
            .bind(i64::from(batch))
            .bind(i64::from(keep))
            .execute(pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn delete_finished_before(&self, cutoff: i64, batch: u32) -> Result<u64> {
        let pool = &self.pool;
        retry_on_sqlite_busy("job.delete_finished_before", || async move {
            let result = sqlx::query(
                r#"
                DELETE FROM job WHERE id IN (
                    SELECT id FROM job
                    WHERE status IN ('COMPLETED', 'FAILED') AND finished_at < ?
                    LIMIT ?
                )
                "#,
            )
            .bind(cutoff)
            .bind(i64::from(batch))
            .execute(pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::JobState;
    use crate::database::test_support::migrated_pool;

    async fn repo() -> (tempfile::TempDir, SqlxJobRepository) {
        let dir = tempfile::tempdir().unwrap();
        let pool = migrated_pool(&dir).await;
        (dir, SqlxJobRepository::new(pool))
    }

    fn job(priority: i64, delay_ms: i64) -> JobRecord {
        JobRecord::new("itinerary", r#"{"itineraryId":1}"#, priority, delay_ms, 3, 1000)
    }

    #[tokio::test]
    async fn claim_prefers_priority_then_age_and_skips_delayed() {
        let (_dir, repo) = repo().await;
        let low = job(0, 0);
        let high = job(5, 0);
        let later = job(10, 60_000);
        repo.insert(&low).await.unwrap();
        repo.insert(&high).await.unwrap();
        repo.insert(&later).await.unwrap();

        let first = repo.claim_next("itinerary", "w1").await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        assert_eq!(first.state(), Some(JobState::Active));
        assert_eq!(first.attempts, 1);
        assert_eq!(first.worker_id.as_deref(), Some("w1"));

        let second = repo.claim_next("itinerary", "w1").await.unwrap().unwrap();
        assert_eq!(second.id, low.id);

        assert!(repo.claim_next("itinerary", "w1").await.unwrap().is_none());
        assert!(repo.claim_next("other", "w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn depth_splits_waiting_active_delayed() {
        let (_dir, repo) = repo().await;
        repo.insert(&job(0, 0)).await.unwrap();
        repo.insert(&job(0, 0)).await.unwrap();
        repo.insert(&job(0, 60_000)).await.unwrap();
        repo.claim_next("itinerary", "w").await.unwrap();

        let depth = repo.depth("itinerary").await.unwrap();
        assert_eq!(
            depth,
            QueueDepth {
                waiting: 1,
                active: 1,
                delayed: 1
            }
        );
        assert_eq!(repo.depth("empty").await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn retry_and_failure_only_touch_active_jobs() {
        let (_dir, repo) = repo().await;
        let j = job(0, 0);
        repo.insert(&j).await.unwrap();
        assert!(!repo.mark_completed(&j.id).await.unwrap());

        repo.claim_next("itinerary", "w").await.unwrap();
        assert!(repo.schedule_retry(&j.id, "boom", now_ms() + 60_000).await.unwrap());
        let stored = repo.get(&j.id).await.unwrap().unwrap();
        assert_eq!(stored.state(), Some(JobState::Waiting));
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
        assert!(stored.worker_id.is_none());
        assert!(!repo.mark_failed(&j.id, "x").await.unwrap());
    }

    #[tokio::test]
    async fn stalled_jobs_requeue_then_fail() {
        let (_dir, repo) = repo().await;
        let j = job(0, 0);
        repo.insert(&j).await.unwrap();

        repo.claim_next("itinerary", "w").await.unwrap();
        let sweep = repo
            .requeue_stalled("itinerary", now_ms() + 1, 1)
            .await
            .unwrap();
        assert_eq!(sweep, StallSweep { requeued: 1, failed: 0 });

        repo.claim_next("itinerary", "w").await.unwrap().unwrap();
        let sweep = repo
            .requeue_stalled("itinerary", now_ms() + 1, 1)
            .await
            .unwrap();
        assert_eq!(sweep, StallSweep { requeued: 0, failed: 1 });

        let stored = repo.get(&j.id).await.unwrap().unwrap();
        assert_eq!(stored.state(), Some(JobState::Failed));
        assert_eq!(stored.stall_count, 2);
    }

    #[tokio::test]
    async fn fresh_locks_are_not_stalled() {
        let (_dir, repo) = repo().await;
        repo.insert(&job(0, 0)).await.unwrap();
        repo.claim_next("itinerary", "w").await.unwrap();

        let sweep = repo
            .requeue_stalled("itinerary", now_ms() - 60_000, 1)
            .await
            .unwrap();
        assert_eq!(sweep, StallSweep::default());
    }

    #[tokio::test]
    async fn trim_keeps_newest_finished_rows() {
        let (_dir, repo) = repo().await;
        for _ in 0..5 {
            let j = job(0, 0);
            repo.insert(&j).await.unwrap();
            repo.claim_next("itinerary", "w").await.unwrap();
            repo.mark_completed(&j.id).await.unwrap();
        }

        let deleted = repo.trim_finished("COMPLETED", 2, 100).await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(repo.trim_finished("COMPLETED", 2, 100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ping_succeeds_on_open_pool() {
        let (_dir, repo) = repo().await;
        repo.ping().await.unwrap();
    }
}
