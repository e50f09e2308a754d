//! SQL DDL for initializing the database schema.

/// All tables and indexes, applied statement by statement at open.
///
/// `events.event_id` is AUTOINCREMENT so ids stay strictly increasing even
/// after revocation purges delete rows.
pub const SQLITE_INIT: &str = r#"
-- Athletes: Strava users who have authorized the application
CREATE TABLE IF NOT EXISTS athletes (
    athlete_id INTEGER PRIMARY KEY,
    credential_set TEXT NOT NULL,

    -- OAuth tokens
    access_token TEXT NOT NULL,
    refresh_token TEXT NOT NULL,
    token_expires_at INTEGER NOT NULL,

    -- Athlete summary blob from the token exchange (JSON)
    athlete_summary TEXT,

    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Webhook queue: raw notifications awaiting hydration
CREATE TABLE IF NOT EXISTS webhook_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    data TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_retry_at INTEGER,
    processing_started_at INTEGER,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_webhook_queue_next_retry ON webhook_queue(next_retry_at);

-- Backfill jobs: historical activity listing and per-activity sync
CREATE TABLE IF NOT EXISTS backfill_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    athlete_id INTEGER NOT NULL,
    job_kind TEXT NOT NULL,
    activity_id INTEGER,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_retry_at INTEGER,
    processing_started_at INTEGER,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_backfill_jobs_next_retry ON backfill_jobs(next_retry_at);
CREATE INDEX IF NOT EXISTS idx_backfill_jobs_athlete ON backfill_jobs(athlete_id);

-- Event log: the cursor-addressable output stream
CREATE TABLE IF NOT EXISTS events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    athlete_id INTEGER NOT NULL,
    activity_id INTEGER,
    athlete_summary TEXT,
    activity TEXT,
    webhook_event TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_athlete ON events(athlete_id);

-- Rate-limit circuit breaker (singleton row)
CREATE TABLE IF NOT EXISTS circuit_breaker_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    state TEXT NOT NULL DEFAULT 'closed',
    opened_at INTEGER,
    closes_at INTEGER,
    last_429_at INTEGER,
    remaining_15min INTEGER,
    remaining_daily INTEGER,
    consecutive_successes INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);

INSERT OR IGNORE INTO circuit_breaker_state (id, state, consecutive_successes, updated_at)
VALUES (1, 'closed', 0, strftime('%s','now'));
"#;
