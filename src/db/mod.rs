//! Database layer (SQLite).
//!
//! One file per entity, all going through the shared [`Store`]. Queue claim
//! semantics live here: a claim is a single atomic `UPDATE … RETURNING` so
//! that concurrent workers never receive the same row.

pub mod athletes;
pub mod backfill_jobs;
pub mod circuit_breaker;
pub mod events;
pub mod schema;
pub mod store;
pub mod webhook_queue;

pub use athletes::Athlete;
pub use backfill_jobs::{BackfillJob, BackfillJobKind};
pub use circuit_breaker::{CircuitBreakerState, CircuitState};
pub use events::{Event, EventType};
pub use store::Store;
pub use webhook_queue::WebhookQueueItem;

/// How long before a processing lock is considered stale, in seconds.
pub const STALE_LOCK_SECS: i64 = 5 * 60;

/// Maximum number of retry attempts before a queue item is dropped.
pub const MAX_RETRIES: i64 = 10;

/// Exponential backoff schedule, indexed by new retry count (1-based).
const BACKOFF_MINUTES: [i64; 7] = [1, 5, 15, 30, 60, 120, 240];

/// Backoff delay in seconds for the given (already incremented) retry count.
/// Retry counts beyond the table clamp to the last entry.
pub fn backoff_secs(new_retry_count: i64) -> i64 {
    let idx = (new_retry_count - 1).clamp(0, BACKOFF_MINUTES.len() as i64 - 1) as usize;
    BACKOFF_MINUTES[idx] * 60
}

/// Outcome of releasing a failed queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Released back to the queue; ready again at the contained instant.
    Released { next_retry_at: i64 },
    /// Exceeded the retry budget and was deleted.
    Dropped,
}

impl ReleaseOutcome {
    pub fn is_dropped(&self) -> bool {
        matches!(self, ReleaseOutcome::Dropped)
    }
}
