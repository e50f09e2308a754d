// SPDX-License-Identifier: MIT

//! Athlete records: OAuth tokens and the summary blob from the exchange.

use crate::error::Result;

use super::store::{now_unix, Store};

/// An athlete's authentication data.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Athlete {
    pub athlete_id: i64,
    /// Which credential set this athlete authorized against. Refresh must use
    /// the matching client secret.
    pub credential_set: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expires_at: i64,
    pub athlete_summary: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Store {
    /// Insert or replace an athlete by id. `created_at` is preserved on
    /// conflict; everything else is rotated.
    pub async fn upsert_athlete(&self, athlete: &Athlete) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO athletes (
                athlete_id, credential_set, access_token, refresh_token,
                token_expires_at, athlete_summary, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(athlete_id) DO UPDATE SET
                credential_set = excluded.credential_set,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                token_expires_at = excluded.token_expires_at,
                athlete_summary = excluded.athlete_summary,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(athlete.athlete_id)
        .bind(&athlete.credential_set)
        .bind(&athlete.access_token)
        .bind(&athlete.refresh_token)
        .bind(athlete.token_expires_at)
        .bind(&athlete.athlete_summary)
        .bind(athlete.created_at)
        .bind(athlete.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retrieve an athlete by id, or `None` if unknown.
    pub async fn get_athlete(&self, athlete_id: i64) -> Result<Option<Athlete>> {
        let athlete = sqlx::query_as::<_, Athlete>(
            r#"
            SELECT athlete_id, credential_set, access_token, refresh_token,
                   token_expires_at, athlete_summary, created_at, updated_at
            FROM athletes
            WHERE athlete_id = ?
            "#,
        )
        .bind(athlete_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(athlete)
    }

    /// Rotate an athlete's tokens after a refresh.
    pub async fn update_athlete_tokens(
        &self,
        athlete_id: i64,
        access_token: &str,
        refresh_token: &str,
        expires_at: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE athletes
            SET access_token = ?,
                refresh_token = ?,
                token_expires_at = ?,
                updated_at = ?
            WHERE athlete_id = ?
            "#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .bind(now_unix())
        .bind(athlete_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete an athlete record. Their events are untouched; use
    /// `purge_athlete_events_except` separately on revocation.
    pub async fn delete_athlete(&self, athlete_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM athletes WHERE athlete_id = ?")
            .bind(athlete_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn athlete(athlete_id: i64, created_at: i64) -> Athlete {
        Athlete {
            athlete_id,
            credential_set: "primary".to_string(),
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            token_expires_at: created_at + 21600,
            athlete_summary: Some(format!(r#"{{"id":{athlete_id}}}"#)),
            created_at,
            updated_at: created_at,
        }
    }

    #[tokio::test]
    async fn upsert_preserves_created_at() {
        let db = Store::open(":memory:").await.unwrap();

        db.upsert_athlete(&athlete(12345, 1000)).await.unwrap();

        let mut updated = athlete(12345, 2000);
        updated.access_token = "rotated".to_string();
        db.upsert_athlete(&updated).await.unwrap();

        let stored = db.get_athlete(12345).await.unwrap().unwrap();
        assert_eq!(stored.created_at, 1000);
        assert_eq!(stored.updated_at, 2000);
        assert_eq!(stored.access_token, "rotated");
    }

    #[tokio::test]
    async fn get_missing_athlete_is_none() {
        let db = Store::open(":memory:").await.unwrap();
        assert!(db.get_athlete(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn token_rotation() {
        let db = Store::open(":memory:").await.unwrap();
        db.upsert_athlete(&athlete(12345, 1000)).await.unwrap();

        db.update_athlete_tokens(12345, "a2", "r2", 99999).await.unwrap();

        let stored = db.get_athlete(12345).await.unwrap().unwrap();
        assert_eq!(stored.access_token, "a2");
        assert_eq!(stored.refresh_token, "r2");
        assert_eq!(stored.token_expires_at, 99999);
        // Summary and identity survive a refresh
        assert_eq!(stored.credential_set, "primary");
        assert!(stored.athlete_summary.is_some());
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let db = Store::open(":memory:").await.unwrap();
        db.upsert_athlete(&athlete(12345, 1000)).await.unwrap();
        db.delete_athlete(12345).await.unwrap();
        assert!(db.get_athlete(12345).await.unwrap().is_none());
    }
}
