//! Itinerary repository.
//!
//! Every lifecycle write is a conditional `UPDATE` on `processing_status`, so
//! concurrent callers racing on the same row can never regress or double-write
//! it. The returned `bool` reports whether this caller's update took effect.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{Itinerary, NewItinerary, ProcessingStatus};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Itinerary store.
#[async_trait]
pub trait ItineraryRepository: Send + Sync {
    async fn create(&self, new: NewItinerary) -> Result<Itinerary>;
    async fn find_by_id(&self, id: i64) -> Result<Option<Itinerary>>;

    /// Atomically move `pending` to `processing`. `false` means another caller
    /// already claimed the row or it is no longer pending.
    async fn claim_for_processing(&self, id: i64) -> Result<bool>;

    /// Write all output fields at once. Only applies to a `processing` row whose
    /// outputs are still empty.
    async fn update_content(
        &self,
        id: i64,
        content: &str,
        model: &str,
        pdf_filename: Option<&str>,
        pdf_path: Option<&str>,
    ) -> Result<bool>;

    /// Forward-only status change.
    ///
    /// - `completed` requires `processing` and stamps `completed_at`.
    /// - `failed` applies to any non-terminal row and clears the output fields.
    /// - `processing` behaves like [`claim_for_processing`](Self::claim_for_processing).
    /// - `pending` is rejected.
    async fn update_status(
        &self,
        id: i64,
        status: ProcessingStatus,
        completed_at: Option<i64>,
    ) -> Result<bool>;

    /// Fail an itinerary nobody has claimed yet. Rows already in `processing`
    /// belong to the run that claimed them and are left alone.
    async fn fail_if_pending(&self, id: i64) -> Result<bool>;

    /// Oldest `pending` itineraries first.
    async fn find_pending(&self, limit: u32) -> Result<Vec<Itinerary>>;
}

/// SQLx implementation of [`ItineraryRepository`].
pub struct SqlxItineraryRepository {
    pool: SqlitePool,
}

impl SqlxItineraryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ItineraryRepository for SqlxItineraryRepository {
    async fn create(&self, new: NewItinerary) -> Result<Itinerary> {
        if new.end_date < new.start_date {
            return Err(Error::Other(format!(
                "itinerary end date {} precedes start date {}",
                new.end_date, new.start_date
            )));
        }
        let interests = serde_json::to_string(&new.interests)?;
        let pool = &self.pool;
        let new = &new;
        let interests = interests.as_str();

        retry_on_sqlite_busy("itinerary.create", || async move {
            let row = sqlx::query_as::<_, Itinerary>(
                r#"
                INSERT INTO itinerary (
                    client_id, session_id, destination, start_date, end_date,
                    budget, interests, processing_status, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?)
                RETURNING *
                "#,
            )
            .bind(&new.client_id)
            .bind(&new.session_id)
            .bind(&new.destination)
            .bind(new.start_date)
            .bind(new.end_date)
            .bind(&new.budget)
            .bind(interests)
            .bind(now_ms())
            .fetch_one(pool)
            .await?;
            Ok(row)
        })
        .await
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Itinerary>> {
        let pool = &self.pool;
        retry_on_sqlite_busy("itinerary.find_by_id", || async move {
            let row = sqlx::query_as::<_, Itinerary>("SELECT * FROM itinerary WHERE id = ?")
                .bind(id)
                .fetch_optional(pool)
                .await?;
            Ok(row)
        })
        .await
    }

    async fn claim_for_processing(&self, id: i64) -> Result<bool> {
        let pool = &self.pool;
        retry_on_sqlite_busy("itinerary.claim", || async move {
            let result = sqlx::query(
                "UPDATE itinerary SET processing_status = 'processing' \
                 WHERE id = ? AND processing_status = 'pending'",
            )
            .bind(id)
            .execute(pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn update_content(
        &self,
        id: i64,
        content: &str,
        model: &str,
        pdf_filename: Option<&str>,
        pdf_path: Option<&str>,
    ) -> Result<bool> {
        let pool = &self.pool;
        retry_on_sqlite_busy("itinerary.update_content", || async move {
            let result = sqlx::query(
                r#"
                UPDATE itinerary
                SET generated_content = ?, model_used = ?, pdf_filename = ?, pdf_path = ?
                WHERE id = ? AND processing_status = 'processing' AND generated_content = ''
                "#,
            )
            .bind(content)
            .bind(model)
            .bind(pdf_filename)
            .bind(pdf_path)
            .bind(id)
            .execute(pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn update_status(
        &self,
        id: i64,
        status: ProcessingStatus,
        completed_at: Option<i64>,
    ) -> Result<bool> {
        let pool = &self.pool;
        match status {
            ProcessingStatus::Pending => Err(Error::InvalidStateTransition {
                from: "any".to_string(),
                to: status.to_string(),
            }),
            ProcessingStatus::Processing => self.claim_for_processing(id).await,
            ProcessingStatus::Completed => {
                let completed_at = completed_at.unwrap_or_else(now_ms);
                retry_on_sqlite_busy("itinerary.complete", || async move {
                    let result = sqlx::query(
                        "UPDATE itinerary SET processing_status = 'completed', completed_at = ? \
                         WHERE id = ? AND processing_status = 'processing'",
                    )
                    .bind(completed_at)
                    .bind(id)
                    .execute(pool)
                    .await?;
                    Ok(result.rows_affected() == 1)
                })
                .await
            }
            ProcessingStatus::Failed => {
                retry_on_sqlite_busy("itinerary.fail", || async move {
                    let result = sqlx::query(
                        r#"
                        UPDATE itinerary
                        SET processing_status = 'failed', completed_at = NULL,
                            generated_content = '', model_used = NULL,
                            pdf_filename = NULL, pdf_path = NULL
                        WHERE id = ? AND processing_status IN ('pending', 'processing')
                        "#,
                    )
                    .bind(id)
                    .execute(pool)
                    .await?;
                    Ok(result.rows_affected() == 1)
                })
                .await
            }
        }
    }

    async fn fail_if_pending(&self, id: i64) -> Result<bool> {
        let pool = &self.pool;
        retry_on_sqlite_busy("itinerary.fail_if_pending", || async move {
            let result = sqlx::query(
                "UPDATE itinerary SET processing_status = 'failed' \
                 WHERE id = ? AND processing_status = 'pending'",
            )
            .bind(id)
            .execute(pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn find_pending(&self, limit: u32) -> Result<Vec<Itinerary>> {
        let rows = sqlx::query_as::<_, Itinerary>(
            "SELECT * FROM itinerary WHERE processing_status = 'pending' \
             ORDER BY created_at ASC, id ASC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
