// SPDX-License-Identifier: MIT

//! OAuth 2.0 flow with Strava.
//!
//! Authorization attempts are tracked with one-time CSRF state nonces held in
//! memory with a 10-minute expiry. Completing the flow exchanges the code,
//! stores the athlete, publishes an `athlete_connected` event and kicks off
//! the historical backfill.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ring::rand::SecureRandom;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::{Athlete, BackfillJobKind, Store};
use crate::error::{AppError, Result};

use super::strava::StravaClient;

const AUTHORIZATION_URL: &str = "https://www.strava.com/oauth/authorize";
/// Read all activities, including private ones.
const SCOPE: &str = "activity:read_all";
const STATE_TTL: Duration = Duration::from_secs(10 * 60);
const SCAVENGE_INTERVAL: Duration = Duration::from_secs(60);

struct StateEntry {
    credential_set: String,
    expires_at: Instant,
}

/// Coordinates the OAuth flow: nonce issue/consume, code exchange, athlete
/// upsert, connected-event publication and backfill kickoff.
pub struct OauthManager {
    config: Config,
    db: Store,
    strava: Arc<StravaClient>,
    states: Mutex<HashMap<String, StateEntry>>,
}

impl OauthManager {
    pub fn new(config: Config, db: Store, strava: Arc<StravaClient>) -> Self {
        Self {
            config,
            db,
            strava,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Begin an authorization attempt: issue a state nonce and build the
    /// Strava authorization URL.
    pub fn start(&self, redirect_uri: &str, credential_set: &str) -> Result<(String, String)> {
        let creds = self
            .config
            .credential_set(credential_set)
            .ok_or_else(|| AppError::BadRequest(format!("unknown credential set: {credential_set}")))?;

        let state = generate_state()?;

        self.states.lock().expect("state lock poisoned").insert(
            state.clone(),
            StateEntry {
                credential_set: credential_set.to_string(),
                expires_at: Instant::now() + STATE_TTL,
            },
        );

        let auth_url = format!(
            "{AUTHORIZATION_URL}?client_id={}&redirect_uri={}&response_type=code&scope={SCOPE}&state={}",
            creds.client_id,
            urlencoding::encode(redirect_uri),
            state,
        );

        tracing::info!(credential_set, "generated authorization URL");

        Ok((auth_url, state))
    }

    /// Complete the flow: consume the nonce, exchange the code, store the
    /// athlete, publish the connected event, enqueue the initial backfill.
    ///
    /// The code exchange is the source of truth; event publication and
    /// backfill enqueue are best-effort and only logged on failure.
    pub async fn complete(&self, code: &str, state: &str) -> Result<(i64, String)> {
        let credential_set = self.consume_state(state).ok_or(AppError::BadState)?;

        let token = self.strava.exchange_code(code, &credential_set).await?;

        let athlete_summary = token.athlete.ok_or_else(|| {
            AppError::BadCredentials("token response missing athlete summary".to_string())
        })?;

        #[derive(Deserialize)]
        struct AthleteId {
            id: i64,
        }
        let athlete_id = serde_json::from_str::<AthleteId>(athlete_summary.get())?.id;

        let now = chrono::Utc::now().timestamp();
        self.db
            .upsert_athlete(&Athlete {
                athlete_id,
                credential_set: credential_set.clone(),
                access_token: token.access_token,
                refresh_token: token.refresh_token,
                token_expires_at: token.expires_at,
                athlete_summary: Some(athlete_summary.get().to_string()),
                created_at: now,
                updated_at: now,
            })
            .await?;

        tracing::info!(athlete_id, %credential_set, "stored athlete record");

        match self
            .db
            .append_athlete_connected_event(athlete_id, athlete_summary.get())
            .await
        {
            Ok(event_id) => tracing::info!(athlete_id, event_id, "published athlete_connected event"),
            Err(err) => tracing::error!(athlete_id, error = %err, "failed to publish athlete_connected event"),
        }

        match self
            .db
            .enqueue_backfill(athlete_id, BackfillJobKind::ListActivities, None)
            .await
        {
            Ok(job_id) => tracing::info!(athlete_id, job_id, "enqueued initial backfill"),
            Err(err) => tracing::error!(athlete_id, error = %err, "failed to enqueue initial backfill"),
        }

        Ok((athlete_id, credential_set))
    }

    /// Consume a state nonce: one-time use, rejecting expired or unknown
    /// states. Returns the bound credential set.
    fn consume_state(&self, state: &str) -> Option<String> {
        let mut states = self.states.lock().expect("state lock poisoned");
        let entry = states.remove(state)?;
        if Instant::now() > entry.expires_at {
            return None;
        }
        Some(entry.credential_set)
    }

    /// Drop expired state nonces.
    pub fn purge_expired_states(&self) {
        let now = Instant::now();
        self.states
            .lock()
            .expect("state lock poisoned")
            .retain(|_, entry| now <= entry.expires_at);
    }

    /// Background scavenger: purge expired nonces every minute until
    /// cancelled.
    pub async fn run_state_scavenger(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(SCAVENGE_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => self.purge_expired_states(),
            }
        }
    }

    #[cfg(test)]
    fn insert_state(&self, state: &str, credential_set: &str, expires_at: Instant) {
        self.states.lock().unwrap().insert(
            state.to_string(),
            StateEntry {
                credential_set: credential_set.to_string(),
                expires_at,
            },
        );
    }

    #[cfg(test)]
    fn state_count(&self) -> usize {
        self.states.lock().unwrap().len()
    }
}

/// A 32-byte cryptographically random state nonce, URL-safe encoded.
fn generate_state() -> Result<String> {
    let mut bytes = [0u8; 32];
    ring::rand::SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| AppError::Internal(anyhow::anyhow!("random number generation failed")))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}
