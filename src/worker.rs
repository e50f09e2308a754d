// SPDX-License-Identifier: MIT

//! Queue worker: drains the webhook queue with priority, then the backfill
//! queue when the rate-limit governor permits.
//!
//! A single cooperative loop. Horizontal scaling is safe because all claim
//! contention is resolved by the store's atomic claim statements.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::{BackfillJob, BackfillJobKind, CircuitBreakerState, CircuitState, Store, WebhookQueueItem};
use crate::error::{AppError, Result};
use crate::services::{calculate_cooldown, StravaClient};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const LIST_PAGE_SIZE: i64 = 200;
/// Pause between history pages, to be gentle on the rate budget.
const LIST_PAGE_PAUSE: Duration = Duration::from_millis(100);

/// Processes webhooks and backfill jobs from their durable queues.
pub struct Worker {
    db: Store,
    strava: Arc<StravaClient>,
    config: Config,
    poll_interval: Duration,
}

/// The discriminants we parse out of a raw notification. Everything else in
/// the payload is carried verbatim; Strava's webhook body has loose typing
/// across versions, so we touch as little of it as possible.
#[derive(Debug, Deserialize)]
struct WebhookNotification {
    object_type: String,
    #[serde(default)]
    object_id: Option<i64>,
    #[serde(default)]
    aspect_type: Option<String>,
    #[serde(default)]
    owner_id: Option<i64>,
    #[serde(default)]
    updates: Option<serde_json::Value>,
}

/// Strava signals deauthorization as `updates.authorized == "false"`; accept
/// the boolean form too.
fn is_deauthorization(notification: &WebhookNotification) -> bool {
    notification
        .updates
        .as_ref()
        .and_then(|u| u.get("authorized"))
        .is_some_and(|v| v == "false" || v == false)
}

impl Worker {
    pub fn new(db: Store, strava: Arc<StravaClient>, config: Config) -> Self {
        Self {
            db,
            strava,
            config,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Run until cancelled. Cancellation is observed at every sleep; an item
    /// claimed when the signal arrives is drained to completion.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("starting worker (webhooks + backfill + circuit breaker)");

        loop {
            if cancel.is_cancelled() {
                tracing::info!("stopping worker");
                return;
            }

            if self.tick().await {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("stopping worker");
                        return;
                    }
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
    }

    /// One loop iteration. Returns true when there was nothing to do and the
    /// caller should sleep before polling again.
    async fn tick(&self) -> bool {
        let circuit = match self.db.get_circuit_breaker().await {
            Ok(state) => state,
            Err(err) => {
                tracing::error!(error = %err, "failed to read circuit breaker");
                return true;
            }
        };

        if let Err(err) = self.apply_circuit_transitions(&circuit).await {
            tracing::error!(error = %err, "failed to apply circuit transitions");
        }

        // Webhooks first: real-time events are never throttled.
        match self.db.claim_next_webhook().await {
            Ok(Some(item)) => {
                self.process_webhook(item).await;
                self.count_half_open_success(&circuit).await;
                return false;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!(error = %err, "failed to claim webhook");
                return true;
            }
        }

        if circuit.state == CircuitState::Open {
            return true;
        }

        let (allowed, reason) = self
            .strava
            .rate_limits()
            .can_process_backfill(self.config.webhook_reserve, self.config.throttle_threshold);
        if !allowed {
            tracing::debug!(reason, "backfill throttled");
            return true;
        }

        match self.db.claim_next_backfill().await {
            Ok(Some(job)) => {
                self.process_backfill(job).await;
                self.count_half_open_success(&circuit).await;
                false
            }
            Ok(None) => true,
            Err(err) => {
                tracing::error!(error = %err, "failed to claim backfill job");
                true
            }
        }
    }

    /// Open → half-open once the cooldown elapses; half-open → closed after
    /// enough consecutive successes.
    async fn apply_circuit_transitions(&self, state: &CircuitBreakerState) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        match state.state {
            CircuitState::Open => {
                if state.closes_at.is_some_and(|closes_at| now >= closes_at) {
                    tracing::info!("circuit breaker cooldown elapsed, transitioning to half_open");
                    self.db.transition_circuit_breaker_half_open().await?;
                }
            }
            CircuitState::HalfOpen => {
                if state.consecutive_successes >= self.config.circuit_recovery_count as i64 {
                    tracing::info!(
                        successes = state.consecutive_successes,
                        "circuit breaker recovered"
                    );
                    self.db.transition_circuit_breaker_closed().await?;
                }
            }
            CircuitState::Closed => {}
        }

        Ok(())
    }

    async fn count_half_open_success(&self, circuit: &CircuitBreakerState) {
        if circuit.state == CircuitState::HalfOpen {
            if let Err(err) = self.db.increment_circuit_breaker_successes().await {
                tracing::error!(error = %err, "failed to count half-open success");
            }
        }
    }

    /// Process one claimed webhook: dispatch on object type, then complete
    /// or release with retry accounting.
    async fn process_webhook(&self, item: WebhookQueueItem) {
        tracing::info!(id = item.id, retry_count = item.retry_count, "processing webhook");

        let notification: WebhookNotification = match serde_json::from_str(&item.data) {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(id = item.id, error = %err, "undecodable webhook payload");
                self.release_webhook(item.id, item.retry_count, &format!("invalid JSON: {err}"))
                    .await;
                return;
            }
        };

        let result = match notification.object_type.as_str() {
            "activity" => self.handle_activity(&notification, &item.data).await,
            "athlete" => self.handle_athlete(&notification, &item.data).await,
            other => {
                tracing::warn!(id = item.id, object_type = other, "unknown object_type, dropping");
                Ok(())
            }
        };

        match result {
            Ok(()) => {
                if let Err(err) = self.db.delete_webhook(item.id).await {
                    tracing::error!(id = item.id, error = %err, "failed to delete completed webhook");
                } else {
                    tracing::info!(id = item.id, "webhook processed");
                }
            }
            Err(err) => {
                tracing::error!(id = item.id, error = %err, "failed to process webhook");
                self.release_webhook(item.id, item.retry_count, &err.to_string())
                    .await;
            }
        }
    }

    /// Activity webhooks: hydrate on create/update, record deletes without a
    /// Strava call, drop unknown aspects.
    async fn handle_activity(&self, notification: &WebhookNotification, raw: &str) -> Result<()> {
        let athlete_id = notification
            .owner_id
            .ok_or_else(|| AppError::BadRequest("activity webhook missing owner_id".to_string()))?;
        let activity_id = notification
            .object_id
            .ok_or_else(|| AppError::BadRequest("activity webhook missing object_id".to_string()))?;

        match notification.aspect_type.as_deref() {
            Some("create") | Some("update") => {
                match self.strava.get_activity(athlete_id, activity_id).await {
                    Ok(activity) => {
                        let event_id = self
                            .db
                            .append_webhook_event(athlete_id, Some(activity_id), Some(&activity), raw)
                            .await?;
                        tracing::info!(athlete_id, activity_id, event_id, "hydrated activity webhook");
                        Ok(())
                    }
                    Err(err) if err.is_terminal() => {
                        // Gone or revoked: publish the notification alone.
                        tracing::warn!(athlete_id, activity_id, error = %err, "activity unavailable, publishing bare notification");
                        self.db
                            .append_webhook_event(athlete_id, Some(activity_id), None, raw)
                            .await?;
                        Ok(())
                    }
                    Err(err) if err.is_rate_limited() => {
                        self.open_circuit("webhook_activity").await;
                        Err(err)
                    }
                    Err(err) => Err(err),
                }
            }
            Some("delete") => {
                let event_id = self
                    .db
                    .append_webhook_event(athlete_id, Some(activity_id), None, raw)
                    .await?;
                tracing::info!(athlete_id, activity_id, event_id, "recorded activity delete");
                Ok(())
            }
            aspect => {
                tracing::warn!(athlete_id, activity_id, aspect_type = ?aspect, "unknown aspect_type, skipping");
                Ok(())
            }
        }
    }

    /// Athlete webhooks: only deauthorization is meaningful. It publishes a
    /// revocation event and purges the athlete's history behind it.
    async fn handle_athlete(&self, notification: &WebhookNotification, raw: &str) -> Result<()> {
        let athlete_id = notification
            .owner_id
            .ok_or_else(|| AppError::BadRequest("athlete webhook missing owner_id".to_string()))?;

        if notification.aspect_type.as_deref() != Some("update") {
            tracing::info!(athlete_id, aspect_type = ?notification.aspect_type, "ignoring non-update athlete webhook");
            return Ok(());
        }

        if !is_deauthorization(notification) {
            tracing::info!(athlete_id, "ignoring athlete update that is not a deauthorization");
            return Ok(());
        }

        tracing::info!(athlete_id, "processing athlete deauthorization");

        let event_id = self.db.append_webhook_event(athlete_id, None, None, raw).await?;
        self.db.purge_athlete_events_except(athlete_id, event_id).await?;

        tracing::info!(athlete_id, event_id, "purged athlete events");
        Ok(())
    }

    /// Process one claimed backfill job, then complete or release.
    async fn process_backfill(&self, job: BackfillJob) {
        tracing::info!(
            id = job.id,
            athlete_id = job.athlete_id,
            job_kind = %job.job_kind,
            retry_count = job.retry_count,
            "processing backfill job"
        );

        let result = match BackfillJobKind::parse(&job.job_kind) {
            Some(BackfillJobKind::ListActivities) => self.list_activities(job.athlete_id).await,
            Some(BackfillJobKind::SyncActivity) => match job.activity_id {
                Some(activity_id) => self.sync_activity(job.athlete_id, activity_id).await,
                None => {
                    tracing::error!(id = job.id, "sync_activity job missing activity_id, dropping");
                    if let Err(err) = self.db.delete_backfill(job.id).await {
                        tracing::error!(id = job.id, error = %err, "failed to delete invalid job");
                    }
                    return;
                }
            },
            None => {
                tracing::warn!(id = job.id, job_kind = %job.job_kind, "unknown job kind, dropping");
                if let Err(err) = self.db.delete_backfill(job.id).await {
                    tracing::error!(id = job.id, error = %err, "failed to delete unknown job");
                }
                return;
            }
        };

        match result {
            Ok(()) => {
                if let Err(err) = self.db.delete_backfill(job.id).await {
                    tracing::error!(id = job.id, error = %err, "failed to delete completed job");
                } else {
                    tracing::info!(id = job.id, "backfill job processed");
                }
            }
            Err(err) => {
                tracing::error!(id = job.id, error = %err, "failed to process backfill job");
                self.release_backfill(job.id, job.retry_count, &err.to_string())
                    .await;
            }
        }
    }

    /// Page through the athlete's history, enqueueing a sync job per
    /// activity. Pagination is not checkpointed: a released job restarts at
    /// page 1, and duplicate sync jobs are tolerated because event appends
    /// are additive.
    async fn list_activities(&self, athlete_id: i64) -> Result<()> {
        let mut page = 1;
        let mut total = 0usize;

        loop {
            let (activity_ids, has_more) = match self
                .strava
                .list_activities(athlete_id, page, LIST_PAGE_SIZE)
                .await
            {
                Ok(result) => result,
                Err(err) if err.is_rate_limited() => {
                    self.open_circuit("list_activities").await;
                    return Err(err);
                }
                Err(err) if err.is_terminal() => {
                    tracing::warn!(athlete_id, error = %err, "athlete unavailable during listing, skipping");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            let count = activity_ids.len();
            for activity_id in activity_ids {
                if let Err(err) = self
                    .db
                    .enqueue_backfill(athlete_id, BackfillJobKind::SyncActivity, Some(activity_id))
                    .await
                {
                    // Keep going; the remaining activities are still worth queueing.
                    tracing::error!(athlete_id, activity_id, error = %err, "failed to enqueue sync job");
                }
            }

            total += count;
            tracing::info!(athlete_id, page, count, total, "listed activities page");

            if !has_more || count == 0 {
                break;
            }

            page += 1;
            tokio::time::sleep(LIST_PAGE_PAUSE).await;
        }

        tracing::info!(athlete_id, total, "completed activity listing");
        Ok(())
    }

    /// Hydrate one activity and append a backfill event.
    async fn sync_activity(&self, athlete_id: i64, activity_id: i64) -> Result<()> {
        match self.strava.get_activity(athlete_id, activity_id).await {
            Ok(activity) => {
                let event_id = self
                    .db
                    .append_backfill_event(athlete_id, activity_id, &activity)
                    .await?;
                tracing::debug!(athlete_id, activity_id, event_id, "synced activity");
                Ok(())
            }
            Err(err) if err.is_terminal() => {
                tracing::warn!(athlete_id, activity_id, error = %err, "activity unavailable during sync, skipping");
                Ok(())
            }
            Err(err) if err.is_rate_limited() => {
                self.open_circuit("sync_activity").await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Open the circuit breaker after a 429, with a cooldown spanning to the
    /// next rate-limit window.
    async fn open_circuit(&self, job_kind: &str) {
        tracing::warn!(job_kind, "rate limit hit (429), opening circuit breaker");

        let status = self.strava.rate_limits().status();
        let cooldown = calculate_cooldown(chrono::Utc::now().timestamp());

        match self
            .db
            .open_circuit_breaker(
                status.read_15min.remaining(),
                status.read_daily.remaining(),
                cooldown,
            )
            .await
        {
            Ok(()) => tracing::info!(
                cooldown_secs = cooldown.as_secs(),
                remaining_15min = status.read_15min.remaining(),
                remaining_daily = status.read_daily.remaining(),
                "circuit breaker opened"
            ),
            Err(err) => tracing::error!(error = %err, "failed to open circuit breaker"),
        }
    }

    async fn release_webhook(&self, id: i64, retry_count: i64, error: &str) {
        match self.db.release_webhook(id, retry_count, error).await {
            Ok(outcome) if outcome.is_dropped() => {
                tracing::warn!(id, retry_count, "webhook exceeded max retries, dropped");
            }
            Ok(_) => {
                tracing::info!(id, retry_count = retry_count + 1, "webhook released for retry");
            }
            Err(err) => {
                tracing::error!(id, error = %err, "failed to release webhook");
            }
        }
    }

    async fn release_backfill(&self, id: i64, retry_count: i64, error: &str) {
        match self.db.release_backfill(id, retry_count, error).await {
            Ok(outcome) if outcome.is_dropped() => {
                tracing::warn!(id, retry_count, "backfill job exceeded max retries, dropped");
            }
            Ok(_) => {
                tracing::info!(id, retry_count = retry_count + 1, "backfill job released for retry");
            }
            Err(err) => {
                tracing::error!(id, error = %err, "failed to release backfill job");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Athlete, EventType};
    use serde_json::json;
    use wiremock::matchers::{any, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(server: &MockServer) -> (Worker, Store) {
        let db = Store::open(":memory:").await.unwrap();
        let config = Config::test_default();
        let strava = Arc::new(
            StravaClient::new(config.clone(), db.clone())
                .with_base_urls(server.uri(), format!("{}/oauth/token", server.uri())),
        );
        let worker = Worker::new(db.clone(), strava, config);
        (worker, db)
    }

    async fn connect_athlete(db: &Store, athlete_id: i64) {
        let now = chrono::Utc::now().timestamp();
        db.upsert_athlete(&Athlete {
            athlete_id,
            credential_set: "primary".to_string(),
            access_token: "token".to_string(),
            refresh_token: "refresh".to_string(),
            token_expires_at: now + 6 * 3600,
            athlete_summary: Some(format!(r#"{{"id":{athlete_id}}}"#)),
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn webhook_create_hydrates_activity() {
        let server = MockServer::start().await;
        let (worker, db) = setup(&server).await;
        connect_athlete(&db, 12345).await;

        Mock::given(method("GET"))
            .and(path("/activities/67890"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 67890, "name": "Run"})))
            .mount(&server)
            .await;

        let raw = json!({
            "object_type": "activity",
            "object_id": 67890,
            "aspect_type": "create",
            "owner_id": 12345,
            "event_time": 1_700_000_000,
        })
        .to_string();
        db.enqueue_webhook(&raw).await.unwrap();

        let item = db.claim_next_webhook().await.unwrap().unwrap();
        worker.process_webhook(item).await;

        let events = db.read_events(0, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Webhook);
        assert_eq!(events[0].athlete_id, 12345);
        assert_eq!(events[0].activity_id, Some(67890));
        assert!(events[0].activity.as_ref().unwrap().get().contains("Run"));
        assert_eq!(events[0].webhook_event.as_ref().unwrap().get(), raw);

        assert_eq!(db.webhook_queue_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn webhook_delete_skips_strava() {
        let server = MockServer::start().await;
        let (worker, db) = setup(&server).await;
        connect_athlete(&db, 12345).await;

        // Deletes must not hit the API at all.
        Mock::given(any())
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let raw = json!({
            "object_type": "activity",
            "object_id": 67890,
            "aspect_type": "delete",
            "owner_id": 12345,
            "event_time": 1_700_000_000,
        })
        .to_string();
        db.enqueue_webhook(&raw).await.unwrap();

        let item = db.claim_next_webhook().await.unwrap().unwrap();
        worker.process_webhook(item).await;

        let events = db.read_events(0, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].activity_id, Some(67890));
        assert!(events[0].activity.is_none());
        assert!(events[0].webhook_event.is_some());
        assert_eq!(db.webhook_queue_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn webhook_create_not_found_publishes_bare_notification() {
        let server = MockServer::start().await;
        let (worker, db) = setup(&server).await;
        connect_athlete(&db, 12345).await;

        Mock::given(method("GET"))
            .and(path("/activities/67890"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let raw = json!({
            "object_type": "activity",
            "object_id": 67890,
            "aspect_type": "create",
            "owner_id": 12345,
        })
        .to_string();
        db.enqueue_webhook(&raw).await.unwrap();

        let item = db.claim_next_webhook().await.unwrap().unwrap();
        worker.process_webhook(item).await;

        let events = db.read_events(0, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].activity.is_none());
        // Completed, not retried
        assert_eq!(db.webhook_queue_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deauthorization_purges_athlete_events() {
        let server = MockServer::start().await;
        let (worker, db) = setup(&server).await;
        connect_athlete(&db, 12345).await;

        db.append_athlete_connected_event(12345, r#"{"id":12345}"#)
            .await
            .unwrap();
        db.append_webhook_event(12345, Some(1), None, r#"{"object_id":1}"#)
            .await
            .unwrap();
        // Another athlete's event must survive the purge
        let other = db
            .append_athlete_connected_event(777, r#"{"id":777}"#)
            .await
            .unwrap();

        let raw = json!({
            "object_type": "athlete",
            "object_id": 12345,
            "owner_id": 12345,
            "aspect_type": "update",
            "updates": {"authorized": "false"},
        })
        .to_string();
        db.enqueue_webhook(&raw).await.unwrap();

        let item = db.claim_next_webhook().await.unwrap().unwrap();
        worker.process_webhook(item).await;

        let events = db.read_events(0, 10).await.unwrap();
        let for_athlete: Vec<_> = events.iter().filter(|e| e.athlete_id == 12345).collect();
        assert_eq!(for_athlete.len(), 1);
        assert_eq!(for_athlete[0].event_type, EventType::Webhook);
        assert!(for_athlete[0].activity_id.is_none());
        assert!(events.iter().any(|e| e.event_id == other));
    }

    #[tokio::test]
    async fn athlete_update_without_deauthorization_is_ignored() {
        let server = MockServer::start().await;
        let (worker, db) = setup(&server).await;

        let raw = json!({
            "object_type": "athlete",
            "object_id": 12345,
            "owner_id": 12345,
            "aspect_type": "update",
            "updates": {"authorized": "true"},
        })
        .to_string();
        db.enqueue_webhook(&raw).await.unwrap();

        let item = db.claim_next_webhook().await.unwrap().unwrap();
        worker.process_webhook(item).await;

        assert!(db.read_events(0, 10).await.unwrap().is_empty());
        assert_eq!(db.webhook_queue_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_object_type_is_dropped() {
        let server = MockServer::start().await;
        let (worker, db) = setup(&server).await;

        db.enqueue_webhook(r#"{"object_type":"gear","owner_id":12345}"#)
            .await
            .unwrap();

        let item = db.claim_next_webhook().await.unwrap().unwrap();
        worker.process_webhook(item).await;

        assert!(db.read_events(0, 10).await.unwrap().is_empty());
        assert_eq!(db.webhook_queue_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn undecodable_payload_released_for_retry() {
        let server = MockServer::start().await;
        let (worker, db) = setup(&server).await;

        db.enqueue_webhook("{not json").await.unwrap();

        let item = db.claim_next_webhook().await.unwrap().unwrap();
        worker.process_webhook(item).await;

        // Still queued, with retry accounting
        assert_eq!(db.webhook_queue_len().await.unwrap(), 1);
        assert!(db.claim_next_webhook().await.unwrap().is_none()); // backing off
    }

    #[tokio::test]
    async fn rate_limited_hydration_opens_circuit_and_releases() {
        let server = MockServer::start().await;
        let (worker, db) = setup(&server).await;
        connect_athlete(&db, 12345).await;

        Mock::given(method("GET"))
            .and(path("/activities/67890"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("x-readratelimit-limit", "100,1000")
                    .insert_header("x-readratelimit-usage", "100,500"),
            )
            .mount(&server)
            .await;

        let raw = json!({
            "object_type": "activity",
            "object_id": 67890,
            "aspect_type": "create",
            "owner_id": 12345,
        })
        .to_string();
        db.enqueue_webhook(&raw).await.unwrap();

        let item = db.claim_next_webhook().await.unwrap().unwrap();
        worker.process_webhook(item).await;

        let circuit = db.get_circuit_breaker().await.unwrap();
        assert_eq!(circuit.state, CircuitState::Open);
        assert_eq!(circuit.remaining_15min, Some(0));
        assert!(circuit.closes_at.unwrap() > chrono::Utc::now().timestamp());

        // Released for retry, no event published
        assert_eq!(db.webhook_queue_len().await.unwrap(), 1);
        assert!(db.read_events(0, 10).await.unwrap().is_empty());

        // Governor also refuses backfill while the read bucket is exhausted
        let (allowed, _) = worker.strava.rate_limits().can_process_backfill(0.20, 0.70);
        assert!(!allowed);
    }

    #[tokio::test]
    async fn list_activities_paginates_and_enqueues_sync_jobs() {
        let server = MockServer::start().await;
        let (worker, db) = setup(&server).await;
        connect_athlete(&db, 12345).await;

        let full_page: Vec<_> = (1..=200).map(|id| json!({"id": id})).collect();
        Mock::given(method("GET"))
            .and(path("/athlete/activities"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(full_page))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/athlete/activities"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 201}])))
            .mount(&server)
            .await;

        let job_id = db
            .enqueue_backfill(12345, BackfillJobKind::ListActivities, None)
            .await
            .unwrap();

        let job = db.claim_next_backfill().await.unwrap().unwrap();
        assert_eq!(job.id, job_id);
        worker.process_backfill(job).await;

        // 201 sync jobs queued; the listing job itself completed
        assert_eq!(db.backfill_queue_len().await.unwrap(), 201);
        let next = db.claim_next_backfill().await.unwrap().unwrap();
        assert_eq!(next.job_kind, "sync_activity");
        assert_eq!(next.activity_id, Some(1));
    }

    #[tokio::test]
    async fn sync_activity_appends_backfill_event() {
        let server = MockServer::start().await;
        let (worker, db) = setup(&server).await;
        connect_athlete(&db, 12345).await;

        Mock::given(method("GET"))
            .and(path("/activities/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 42, "name": "Swim"})))
            .mount(&server)
            .await;

        db.enqueue_backfill(12345, BackfillJobKind::SyncActivity, Some(42))
            .await
            .unwrap();

        let job = db.claim_next_backfill().await.unwrap().unwrap();
        worker.process_backfill(job).await;

        let events = db.read_events(0, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Backfill);
        assert_eq!(events[0].activity_id, Some(42));
        assert!(events[0].webhook_event.is_none());
        assert_eq!(db.backfill_queue_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sync_activity_not_found_completes_silently() {
        let server = MockServer::start().await;
        let (worker, db) = setup(&server).await;
        connect_athlete(&db, 12345).await;

        Mock::given(method("GET"))
            .and(path("/activities/42"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        db.enqueue_backfill(12345, BackfillJobKind::SyncActivity, Some(42))
            .await
            .unwrap();

        let job = db.claim_next_backfill().await.unwrap().unwrap();
        worker.process_backfill(job).await;

        assert!(db.read_events(0, 10).await.unwrap().is_empty());
        assert_eq!(db.backfill_queue_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_token_refreshed_before_hydration() {
        let server = MockServer::start().await;
        let (worker, db) = setup(&server).await;

        // Token expired an hour ago
        let now = chrono::Utc::now().timestamp();
        db.upsert_athlete(&Athlete {
            athlete_id: 12345,
            credential_set: "primary".to_string(),
            access_token: "stale".to_string(),
            refresh_token: "refresh-1".to_string(),
            token_expires_at: now - 3600,
            athlete_summary: None,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();

        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh",
                "refresh_token": "refresh-2",
                "expires_at": now + 21600,
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/activities/42"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 42})))
            .mount(&server)
            .await;

        worker.sync_activity(12345, 42).await.unwrap();

        let athlete = db.get_athlete(12345).await.unwrap().unwrap();
        assert_eq!(athlete.access_token, "fresh");
        assert_eq!(athlete.refresh_token, "refresh-2");
        assert_eq!(athlete.token_expires_at, now + 21600);
    }

    #[tokio::test]
    async fn open_circuit_blocks_backfill_but_not_webhooks() {
        let server = MockServer::start().await;
        let (worker, db) = setup(&server).await;
        connect_athlete(&db, 12345).await;

        db.open_circuit_breaker(0, 0, Duration::from_secs(600))
            .await
            .unwrap();
        db.enqueue_backfill(12345, BackfillJobKind::SyncActivity, Some(42))
            .await
            .unwrap();

        // A delete webhook needs no Strava call, so it processes even while
        // the circuit is open.
        let raw = json!({
            "object_type": "activity",
            "object_id": 1,
            "aspect_type": "delete",
            "owner_id": 12345,
        })
        .to_string();
        db.enqueue_webhook(&raw).await.unwrap();

        assert!(!worker.tick().await);
        assert_eq!(db.read_events(0, 10).await.unwrap().len(), 1);

        // With the webhook drained, the open circuit leaves the backfill
        // job unclaimed.
        assert!(worker.tick().await);
        assert_eq!(db.ready_backfill_queue_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn circuit_transitions_open_half_open_closed() {
        let server = MockServer::start().await;
        let (worker, db) = setup(&server).await;

        // Open with an already-elapsed cooldown
        db.open_circuit_breaker(0, 100, Duration::ZERO).await.unwrap();
        let state = db.get_circuit_breaker().await.unwrap();
        assert_eq!(state.state, CircuitState::Open);

        worker.apply_circuit_transitions(&state).await.unwrap();
        let state = db.get_circuit_breaker().await.unwrap();
        assert_eq!(state.state, CircuitState::HalfOpen);

        // Not enough successes yet
        worker.apply_circuit_transitions(&state).await.unwrap();
        assert_eq!(db.get_circuit_breaker().await.unwrap().state, CircuitState::HalfOpen);

        for _ in 0..3 {
            db.increment_circuit_breaker_successes().await.unwrap();
        }
        let state = db.get_circuit_breaker().await.unwrap();
        assert_eq!(state.consecutive_successes, 3);

        worker.apply_circuit_transitions(&state).await.unwrap();
        let state = db.get_circuit_breaker().await.unwrap();
        assert_eq!(state.state, CircuitState::Closed);
        assert!(state.closes_at.is_none());
    }

    #[tokio::test]
    async fn worker_run_stops_on_cancel() {
        let server = MockServer::start().await;
        let (worker, _db) = setup(&server).await;

        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker did not stop after cancellation")
            .unwrap();
    }
}
