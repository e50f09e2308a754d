// SPDX-License-Identifier: MIT

//! The event log: the ordered, cursor-addressable output of the relay.
//!
//! Event ids are the cursor. Blobs (athlete summary, hydrated activity, raw
//! notification) are stored and served verbatim as raw JSON.

use serde::Serialize;
use serde_json::value::RawValue;

use crate::error::{AppError, Result};

use super::store::{now_unix, Store};

/// The type of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AthleteConnected,
    Webhook,
    Backfill,
}

impl EventType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "athlete_connected" => Some(EventType::AthleteConnected),
            "webhook" => Some(EventType::Webhook),
            "backfill" => Some(EventType::Backfill),
            _ => None,
        }
    }
}

/// An event in the stream, as served to the consumer.
#[derive(Debug, Serialize)]
pub struct Event {
    pub event_id: i64,
    pub event_type: EventType,
    pub athlete_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<i64>,
    /// For `athlete_connected` events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub athlete_summary: Option<Box<RawValue>>,
    /// Hydrated activity, for `webhook` and `backfill` events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<Box<RawValue>>,
    /// Raw notification, for `webhook` events
    #[serde(rename = "event", skip_serializing_if = "Option::is_none")]
    pub webhook_event: Option<Box<RawValue>>,
    pub created_at: i64,
}

#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: i64,
    event_type: String,
    athlete_id: i64,
    activity_id: Option<i64>,
    athlete_summary: Option<String>,
    activity: Option<String>,
    webhook_event: Option<String>,
    created_at: i64,
}

impl TryFrom<EventRow> for Event {
    type Error = AppError;

    fn try_from(row: EventRow) -> Result<Event> {
        let event_type = EventType::parse(&row.event_type).ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!(
                "unknown event_type in store: {}",
                row.event_type
            ))
        })?;

        Ok(Event {
            event_id: row.event_id,
            event_type,
            athlete_id: row.athlete_id,
            activity_id: row.activity_id,
            athlete_summary: raw_json(row.athlete_summary)?,
            activity: raw_json(row.activity)?,
            webhook_event: raw_json(row.webhook_event)?,
            created_at: row.created_at,
        })
    }
}

fn raw_json(value: Option<String>) -> Result<Option<Box<RawValue>>> {
    value.map(RawValue::from_string).transpose().map_err(AppError::from)
}

impl Store {
    /// Append an `athlete_connected` event, returning its id.
    pub async fn append_athlete_connected_event(
        &self,
        athlete_id: i64,
        athlete_summary: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO events (event_type, athlete_id, athlete_summary, created_at)
            VALUES ('athlete_connected', ?, ?, ?)
            "#,
        )
        .bind(athlete_id)
        .bind(athlete_summary)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Append a `webhook` event. The raw notification is required; the
    /// hydrated activity is absent for deletes and revocations.
    pub async fn append_webhook_event(
        &self,
        athlete_id: i64,
        activity_id: Option<i64>,
        activity: Option<&str>,
        webhook_event: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO events (event_type, athlete_id, activity_id, activity, webhook_event, created_at)
            VALUES ('webhook', ?, ?, ?, ?, ?)
            "#,
        )
        .bind(athlete_id)
        .bind(activity_id)
        .bind(activity)
        .bind(webhook_event)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Append a `backfill` event with a hydrated activity.
    pub async fn append_backfill_event(
        &self,
        athlete_id: i64,
        activity_id: i64,
        activity: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO events (event_type, athlete_id, activity_id, activity, created_at)
            VALUES ('backfill', ?, ?, ?, ?)
            "#,
        )
        .bind(athlete_id)
        .bind(activity_id)
        .bind(activity)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Events with id greater than `cursor`, ascending, at most `limit`.
    pub async fn read_events(&self, cursor: i64, limit: i64) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT event_id, event_type, athlete_id, activity_id,
                   athlete_summary, activity, webhook_event, created_at
            FROM events
            WHERE event_id > ?
            ORDER BY event_id ASC
            LIMIT ?
            "#,
        )
        .bind(cursor)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Event::try_from).collect()
    }

    /// Delete all events for an athlete except one (the revocation event
    /// itself). A single statement, so the purge is atomic.
    pub async fn purge_athlete_events_except(
        &self,
        athlete_id: i64,
        keep_event_id: i64,
    ) -> Result<()> {
        sqlx::query("DELETE FROM events WHERE athlete_id = ? AND event_id != ?")
            .bind(athlete_id)
            .bind(keep_event_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
