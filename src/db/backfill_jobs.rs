// SPDX-License-Identifier: MIT

//! Durable queue of backfill jobs: historical activity listing and
//! per-activity sync.

use crate::error::Result;

use super::store::{now_unix, Store};
use super::{backoff_secs, ReleaseOutcome, MAX_RETRIES, STALE_LOCK_SECS};

/// What a backfill job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillJobKind {
    /// Page through the athlete's history, enqueueing a `SyncActivity` job
    /// per returned activity id.
    ListActivities,
    /// Hydrate one activity and append a `backfill` event.
    SyncActivity,
}

impl BackfillJobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillJobKind::ListActivities => "list_activities",
            BackfillJobKind::SyncActivity => "sync_activity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "list_activities" => Some(BackfillJobKind::ListActivities),
            "sync_activity" => Some(BackfillJobKind::SyncActivity),
            _ => None,
        }
    }
}

/// A backfill job awaiting processing.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BackfillJob {
    pub id: i64,
    pub athlete_id: i64,
    /// Stored as text; unknown kinds are completed without retry by the
    /// worker rather than rejected here.
    pub job_kind: String,
    pub activity_id: Option<i64>,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub next_retry_at: Option<i64>,
    pub processing_started_at: Option<i64>,
    pub created_at: i64,
}

impl Store {
    /// Append a backfill job. `activity_id` is required for `SyncActivity`.
    pub async fn enqueue_backfill(
        &self,
        athlete_id: i64,
        kind: BackfillJobKind,
        activity_id: Option<i64>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO backfill_jobs (athlete_id, job_kind, activity_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(athlete_id)
        .bind(kind.as_str())
        .bind(activity_id)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Atomically claim the oldest ready backfill job; same contract as
    /// `claim_next_webhook`.
    pub async fn claim_next_backfill(&self) -> Result<Option<BackfillJob>> {
        let now = now_unix();
        let stale_threshold = now - STALE_LOCK_SECS;

        let job = sqlx::query_as::<_, BackfillJob>(
            r#"
            UPDATE backfill_jobs
            SET processing_started_at = ?
            WHERE id = (
                SELECT id
                FROM backfill_jobs
                WHERE (next_retry_at IS NULL OR next_retry_at <= ?)
                  AND (processing_started_at IS NULL OR processing_started_at < ?)
                ORDER BY id ASC
                LIMIT 1
            )
            RETURNING id, athlete_id, job_kind, activity_id, retry_count,
                      last_error, next_retry_at, processing_started_at, created_at
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(stale_threshold)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Delete a completed backfill job.
    pub async fn delete_backfill(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM backfill_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Release a failed backfill job with retry accounting; drops past the
    /// retry budget.
    pub async fn release_backfill(
        &self,
        id: i64,
        retry_count: i64,
        error: &str,
    ) -> Result<ReleaseOutcome> {
        let new_retry_count = retry_count + 1;

        if new_retry_count > MAX_RETRIES {
            self.delete_backfill(id).await?;
            return Ok(ReleaseOutcome::Dropped);
        }

        let next_retry_at = now_unix() + backoff_secs(new_retry_count);

        sqlx::query(
            r#"
            UPDATE backfill_jobs
            SET retry_count = ?,
                last_error = ?,
                next_retry_at = ?,
                processing_started_at = NULL
            WHERE id = ?
            "#,
        )
        .bind(new_retry_count)
        .bind(error)
        .bind(next_retry_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(ReleaseOutcome::Released { next_retry_at })
    }

    /// Total number of backfill jobs in the queue.
    pub async fn backfill_queue_len(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM backfill_jobs")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Number of backfill jobs ready to process right now.
    pub async fn ready_backfill_queue_len(&self) -> Result<i64> {
        let now = now_unix();
        let stale_threshold = now - STALE_LOCK_SECS;

        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM backfill_jobs
            WHERE (next_retry_at IS NULL OR next_retry_at <= ?)
              AND (processing_started_at IS NULL OR processing_started_at < ?)
            "#,
        )
        .bind(now)
        .bind(stale_threshold)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Store {
        Store::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn enqueue_and_claim_round_trip() {
        let db = test_store().await;
        let list_id = db
            .enqueue_backfill(12345, BackfillJobKind::ListActivities, None)
            .await
            .unwrap();
        let sync_id = db
            .enqueue_backfill(12345, BackfillJobKind::SyncActivity, Some(42))
            .await
            .unwrap();

        let first = db.claim_next_backfill().await.unwrap().unwrap();
        assert_eq!(first.id, list_id);
        assert_eq!(first.job_kind, "list_activities");
        assert_eq!(first.activity_id, None);

        let second = db.claim_next_backfill().await.unwrap().unwrap();
        assert_eq!(second.id, sync_id);
        assert_eq!(second.activity_id, Some(42));

        assert!(db.claim_next_backfill().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_completes_job() {
        let db = test_store().await;
        let id = db
            .enqueue_backfill(12345, BackfillJobKind::SyncActivity, Some(42))
            .await
            .unwrap();

        db.delete_backfill(id).await.unwrap();
        assert_eq!(db.backfill_queue_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn release_and_drop_accounting() {
        let db = test_store().await;
        let id = db
            .enqueue_backfill(12345, BackfillJobKind::SyncActivity, Some(42))
            .await
            .unwrap();

        let outcome = db.release_backfill(id, 0, "boom").await.unwrap();
        assert!(!outcome.is_dropped());
        assert_eq!(db.ready_backfill_queue_len().await.unwrap(), 0);

        let outcome = db.release_backfill(id, MAX_RETRIES, "boom").await.unwrap();
        assert!(outcome.is_dropped());
        assert_eq!(db.backfill_queue_len().await.unwrap(), 0);
    }

    #[test]
    fn job_kind_parsing() {
        assert_eq!(
            BackfillJobKind::parse("list_activities"),
            Some(BackfillJobKind::ListActivities)
        );
        assert_eq!(
            BackfillJobKind::parse("sync_activity"),
            Some(BackfillJobKind::SyncActivity)
        );
        assert_eq!(BackfillJobKind::parse("reindex"), None);
    }
}
