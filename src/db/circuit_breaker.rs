// SPDX-License-Identifier: MIT

//! Persisted rate-limit circuit-breaker state (singleton row).

use crate::error::Result;

use super::store::{now_unix, Store};

/// Circuit-breaker phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half_open",
            CircuitState::Open => "open",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "open" => CircuitState::Open,
            "half_open" => CircuitState::HalfOpen,
            // Unknown values degrade to closed rather than wedging the worker
            _ => CircuitState::Closed,
        }
    }
}

/// The singleton circuit-breaker row.
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub opened_at: Option<i64>,
    pub closes_at: Option<i64>,
    pub last_429_at: Option<i64>,
    pub remaining_15min: Option<i64>,
    pub remaining_daily: Option<i64>,
    pub consecutive_successes: i64,
    pub updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct CircuitBreakerRow {
    state: String,
    opened_at: Option<i64>,
    closes_at: Option<i64>,
    last_429_at: Option<i64>,
    remaining_15min: Option<i64>,
    remaining_daily: Option<i64>,
    consecutive_successes: i64,
    updated_at: i64,
}

impl Store {
    /// Read the circuit-breaker state. A missing row reads as closed.
    pub async fn get_circuit_breaker(&self) -> Result<CircuitBreakerState> {
        let row = sqlx::query_as::<_, CircuitBreakerRow>(
            r#"
            SELECT state, opened_at, closes_at, last_429_at,
                   remaining_15min, remaining_daily, consecutive_successes, updated_at
            FROM circuit_breaker_state
            WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => CircuitBreakerState {
                state: CircuitState::parse(&row.state),
                opened_at: row.opened_at,
                closes_at: row.closes_at,
                last_429_at: row.last_429_at,
                remaining_15min: row.remaining_15min,
                remaining_daily: row.remaining_daily,
                consecutive_successes: row.consecutive_successes,
                updated_at: row.updated_at,
            },
            None => CircuitBreakerState {
                state: CircuitState::Closed,
                opened_at: None,
                closes_at: None,
                last_429_at: None,
                remaining_15min: None,
                remaining_daily: None,
                consecutive_successes: 0,
                updated_at: now_unix(),
            },
        })
    }

    /// Open the circuit after a 429, recording remaining budget and the
    /// cooldown deadline.
    pub async fn open_circuit_breaker(
        &self,
        remaining_15min: i64,
        remaining_daily: i64,
        cooldown: std::time::Duration,
    ) -> Result<()> {
        let now = now_unix();
        let closes_at = now + cooldown.as_secs() as i64;

        sqlx::query(
            r#"
            UPDATE circuit_breaker_state
            SET state = 'open',
                opened_at = ?,
                closes_at = ?,
                last_429_at = ?,
                remaining_15min = ?,
                remaining_daily = ?,
                consecutive_successes = 0,
                updated_at = ?
            WHERE id = 1
            "#,
        )
        .bind(now)
        .bind(closes_at)
        .bind(now)
        .bind(remaining_15min)
        .bind(remaining_daily)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Move an open circuit into the probing phase. A no-op unless open.
    pub async fn transition_circuit_breaker_half_open(&self) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE circuit_breaker_state
            SET state = 'half_open',
                consecutive_successes = 0,
                updated_at = ?
            WHERE id = 1 AND state = 'open'
            "#,
        )
        .bind(now_unix())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Close the circuit after recovery.
    pub async fn transition_circuit_breaker_closed(&self) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE circuit_breaker_state
            SET state = 'closed',
                opened_at = NULL,
                closes_at = NULL,
                consecutive_successes = 0,
                updated_at = ?
            WHERE id = 1
            "#,
        )
        .bind(now_unix())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Count a non-failing iteration while half-open. A no-op otherwise.
    pub async fn increment_circuit_breaker_successes(&self) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE circuit_breaker_state
            SET consecutive_successes = consecutive_successes + 1,
                updated_at = ?
            WHERE id = 1 AND state = 'half_open'
            "#,
        )
        .bind(now_unix())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
