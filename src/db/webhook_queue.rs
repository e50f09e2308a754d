// SPDX-License-Identifier: MIT

//! Durable queue of raw webhook notifications awaiting hydration.

use crate::error::Result;

use super::store::{now_unix, Store};
use super::{backoff_secs, ReleaseOutcome, MAX_RETRIES, STALE_LOCK_SECS};

/// A webhook notification awaiting processing.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebhookQueueItem {
    pub id: i64,
    /// Raw notification payload, stored verbatim.
    pub data: String,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub next_retry_at: Option<i64>,
    pub processing_started_at: Option<i64>,
    pub created_at: i64,
}

impl Store {
    /// Append a raw notification to the webhook queue.
    pub async fn enqueue_webhook(&self, data: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO webhook_queue (data, created_at) VALUES (?, ?)")
            .bind(data)
            .bind(now_unix())
            .execute(&self.pool)
            .await?;

        Ok(result.last_insert_rowid())
    }

    /// Atomically claim the oldest ready webhook, or `None` if nothing is
    /// ready. An item is ready when its retry time has passed (or was never
    /// set) and no live worker holds it (no lock, or a stale one).
    ///
    /// The claim is a single UPDATE so two concurrent callers can never
    /// receive the same row.
    pub async fn claim_next_webhook(&self) -> Result<Option<WebhookQueueItem>> {
        let now = now_unix();
        let stale_threshold = now - STALE_LOCK_SECS;

        let item = sqlx::query_as::<_, WebhookQueueItem>(
            r#"
            UPDATE webhook_queue
            SET processing_started_at = ?
            WHERE id = (
                SELECT id
                FROM webhook_queue
                WHERE (next_retry_at IS NULL OR next_retry_at <= ?)
                  AND (processing_started_at IS NULL OR processing_started_at < ?)
                ORDER BY id ASC
                LIMIT 1
            )
            RETURNING id, data, retry_count, last_error, next_retry_at,
                      processing_started_at, created_at
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(stale_threshold)
        .fetch_optional(&self.pool)
        .await?;

        Ok(item)
    }

    /// Delete a completed webhook from the queue.
    pub async fn delete_webhook(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM webhook_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Release a failed webhook back to the queue with retry accounting.
    /// Items past the retry budget are dropped.
    pub async fn release_webhook(
        &self,
        id: i64,
        retry_count: i64,
        error: &str,
    ) -> Result<ReleaseOutcome> {
        let new_retry_count = retry_count + 1;

        if new_retry_count > MAX_RETRIES {
            self.delete_webhook(id).await?;
            return Ok(ReleaseOutcome::Dropped);
        }

        let next_retry_at = now_unix() + backoff_secs(new_retry_count);

        sqlx::query(
            r#"
            UPDATE webhook_queue
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

    /// Total number of items in the webhook queue.
    pub async fn webhook_queue_len(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM webhook_queue")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Number of webhook items ready to process right now.
    pub async fn ready_webhook_queue_len(&self) -> Result<i64> {
        let now = now_unix();
        let stale_threshold = now - STALE_LOCK_SECS;

        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM webhook_queue
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
