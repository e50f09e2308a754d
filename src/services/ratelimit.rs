// SPDX-License-Identifier: MIT

//! In-memory Strava rate-limit tracking and backfill admission control.
//!
//! Strava reports two bucket pairs per response: overall and read-only, each
//! as a "15min,daily" usage/limit pair. Backfill admission looks only at the
//! read buckets, since hydration is all reads; a slice of the read budget is
//! reserved for real-time webhook traffic.

use std::sync::RwLock;
use std::time::Duration;

/// One usage/limit pair.
#[derive(Debug, Clone, Copy)]
pub struct Bucket {
    pub usage: i64,
    pub limit: i64,
}

impl Bucket {
    fn fraction(&self) -> f64 {
        if self.limit <= 0 {
            return 0.0;
        }
        self.usage as f64 / self.limit as f64
    }

    pub fn remaining(&self) -> i64 {
        self.limit - self.usage
    }
}

#[derive(Debug, Clone, Copy)]
struct Counters {
    overall_15min: Bucket,
    overall_daily: Bucket,
    read_15min: Bucket,
    read_daily: Bucket,
    last_updated: Option<i64>,
}

/// Snapshot of the current rate-limit state.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitStatus {
    pub overall_15min: Bucket,
    pub overall_daily: Bucket,
    pub read_15min: Bucket,
    pub read_daily: Bucket,
    pub last_updated: Option<i64>,
}

/// Shared rate-limit counters, updated from response headers on every Strava
/// call. Reads vastly outnumber writes, hence the RwLock.
pub struct RateLimits {
    inner: RwLock<Counters>,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimits {
    pub fn new() -> Self {
        // Default Strava limits, replaced by headers on the first response
        Self {
            inner: RwLock::new(Counters {
                overall_15min: Bucket { usage: 0, limit: 200 },
                overall_daily: Bucket { usage: 0, limit: 2000 },
                read_15min: Bucket { usage: 0, limit: 100 },
                read_daily: Bucket { usage: 0, limit: 1000 },
                last_updated: None,
            }),
        }
    }

    /// Update the overall buckets from a response.
    pub fn set_overall(&self, limit_15min: i64, usage_15min: i64, limit_daily: i64, usage_daily: i64) {
        let mut inner = self.inner.write().expect("rate limit lock poisoned");
        inner.overall_15min = Bucket { usage: usage_15min, limit: limit_15min };
        inner.overall_daily = Bucket { usage: usage_daily, limit: limit_daily };
        inner.last_updated = Some(chrono::Utc::now().timestamp());
    }

    /// Update the read buckets from a response.
    pub fn set_read(&self, limit_15min: i64, usage_15min: i64, limit_daily: i64, usage_daily: i64) {
        let mut inner = self.inner.write().expect("rate limit lock poisoned");
        inner.read_15min = Bucket { usage: usage_15min, limit: limit_15min };
        inner.read_daily = Bucket { usage: usage_daily, limit: limit_daily };
        inner.last_updated = Some(chrono::Utc::now().timestamp());
    }

    /// Snapshot the current counters.
    pub fn status(&self) -> RateLimitStatus {
        let inner = self.inner.read().expect("rate limit lock poisoned");
        RateLimitStatus {
            overall_15min: inner.overall_15min,
            overall_daily: inner.overall_daily,
            read_15min: inner.read_15min,
            read_daily: inner.read_daily,
            last_updated: inner.last_updated,
        }
    }

    /// Proactive throttling: may a backfill job run now?
    ///
    /// Admitted only when, for both read buckets, usage is below the throttle
    /// threshold AND the remaining budget exceeds the webhook reserve.
    /// Returns a denial reason for logging.
    pub fn can_process_backfill(&self, webhook_reserve: f64, throttle_threshold: f64) -> (bool, &'static str) {
        let status = self.status();

        let checks = [
            ("15min", status.read_15min),
            ("daily", status.read_daily),
        ];

        for (window, bucket) in checks {
            if bucket.limit <= 0 {
                continue;
            }
            if bucket.fraction() >= throttle_threshold {
                return (
                    false,
                    match window {
                        "15min" => "read 15-minute bucket over throttle threshold",
                        _ => "read daily bucket over throttle threshold",
                    },
                );
            }
            if (bucket.remaining() as f64) <= webhook_reserve * bucket.limit as f64 {
                return (
                    false,
                    match window {
                        "15min" => "read 15-minute budget inside webhook reserve",
                        _ => "read daily budget inside webhook reserve",
                    },
                );
            }
        }

        (true, "ok")
    }
}

/// Cooldown for an opened circuit: at least 15 seconds, at most until the
/// next quarter-hour boundary, which is when Strava's 15-minute windows
/// reset.
pub fn calculate_cooldown(now_unix: i64) -> Duration {
    const WINDOW_SECS: i64 = 15 * 60;
    let into_window = now_unix.rem_euclid(WINDOW_SECS);
    let until_reset = WINDOW_SECS - into_window;
    Duration::from_secs(until_reset.max(15) as u64)
}
