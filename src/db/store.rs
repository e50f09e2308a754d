// SPDX-License-Identifier: MIT

//! SQLite connection handling.
//!
//! The pool is capped at a single connection: SQLite works best with one
//! writer, and the claim/release contract depends on write serialization.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

use crate::error::Result;

use super::schema::SQLITE_INIT;

/// Handle to the durable store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `path` and apply the schema.
    ///
    /// `":memory:"` opens an in-memory database, used by tests.
    pub async fn open(path: &str) -> Result<Self> {
        let opts = if path == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        }
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create all tables and indexes.
    async fn init_schema(&self) -> Result<()> {
        for stmt in SQLITE_INIT.split(';') {
            let stmt = stmt.trim();
            if stmt.is_empty() {
                continue;
            }
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Check that the database connection is healthy.
    pub async fn health(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Current time as Unix seconds. All persisted instants use this form.
pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
