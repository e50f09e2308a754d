// SPDX-License-Identifier: MIT

//! The event stream endpoint: cursor-addressable reads with optional
//! long-polling, authenticated with the internal API key.

use crate::db::Event;
use crate::error::{AppError, Result};
use crate::AppState;
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::time::Instant;

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const POLL_TIMEOUT: Duration = Duration::from_secs(30);

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/events", get(read_events))
}

#[derive(Deserialize)]
struct EventsParams {
    #[serde(default)]
    cursor: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    long_poll: Option<bool>,
}

#[derive(Serialize)]
struct EventsResponse {
    events: Vec<Event>,
    cursor: i64,
}

/// GET /events: return events past the cursor, optionally long-polling until
/// some arrive or the timeout elapses.
async fn read_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<EventsParams>,
) -> Result<Json<EventsResponse>> {
    authorize(&headers, &state.config.internal_api_key)?;

    let cursor = params.cursor.unwrap_or(0);
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(AppError::BadRequest(format!(
            "limit must be between 1 and {MAX_LIMIT}"
        )));
    }
    let long_poll = params.long_poll.unwrap_or(false);

    tracing::debug!(cursor, limit, long_poll, "events request");

    let events = if long_poll {
        long_poll_events(&state, cursor, limit).await?
    } else {
        state.db.read_events(cursor, limit).await?
    };

    let next_cursor = events.last().map(|e| e.event_id).unwrap_or(cursor);

    Ok(Json(EventsResponse {
        events,
        cursor: next_cursor,
    }))
}

/// Re-poll the store until events arrive or the long-poll window closes.
/// A dropped connection cancels the loop at the next await point.
async fn long_poll_events(state: &AppState, cursor: i64, limit: i64) -> Result<Vec<Event>> {
    let deadline = Instant::now() + POLL_TIMEOUT;

    loop {
        let events = state.db.read_events(cursor, limit).await?;
        if !events.is_empty() {
            return Ok(events);
        }

        if Instant::now() >= deadline {
            tracing::debug!(cursor, "long-poll timeout, returning empty");
            return Ok(events);
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Require `Authorization: Bearer <internal_api_key>`, compared in constant
/// time.
fn authorize(headers: &HeaderMap, api_key: &str) -> Result<()> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(AppError::Unauthorized)?;

    if bool::from(token.as_bytes().ct_eq(api_key.as_bytes())) {
        Ok(())
    } else {
        Err(AppError::Unauthorized)
    }
}
