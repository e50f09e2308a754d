//! Strava API client.
//!
//! The only component that speaks HTTP to Strava. Handles:
//! - Activity hydration and paginated history listing
//! - Token exchange and refresh (serialized per athlete)
//! - Rate-limit header ingestion
//! - Webhook subscription management (used by the CLI)

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::value::RawValue;

use crate::config::Config;
use crate::db::{Athlete, Store};
use crate::error::{AppError, Result};

use super::ratelimit::RateLimits;

const BASE_URL: &str = "https://www.strava.com/api/v3";
const TOKEN_URL: &str = "https://www.strava.com/oauth/token";

/// Refresh tokens this long before they expire.
const TOKEN_REFRESH_SLACK_SECS: i64 = 5 * 60;

/// Strava API client.
pub struct StravaClient {
    http: reqwest::Client,
    base_url: String,
    token_url: String,
    config: Config,
    db: Store,
    limits: Arc<RateLimits>,
    /// Per-athlete refresh locks: concurrent refresh attempts for the same
    /// athlete collapse into a single network refresh.
    refresh_locks: Arc<DashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl StravaClient {
    pub fn new(config: Config, db: Store) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build HTTP client"),
            base_url: BASE_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
            config,
            db,
            limits: Arc::new(RateLimits::new()),
            refresh_locks: Arc::new(DashMap::new()),
        }
    }

    /// Point the client at different endpoints. Used by tests.
    pub fn with_base_urls(mut self, base_url: impl Into<String>, token_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self.token_url = token_url.into();
        self
    }

    /// Shared rate-limit counters, consulted by the worker's governor.
    pub fn rate_limits(&self) -> Arc<RateLimits> {
        Arc::clone(&self.limits)
    }

    /// Exchange an authorization code for tokens using the named credential
    /// set.
    pub async fn exchange_code(&self, code: &str, credential_set: &str) -> Result<TokenResponse> {
        let (client_id, client_secret) = self.client_credentials(credential_set)?;

        self.request_token(&[
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
        ])
        .await
    }

    /// Fetch detailed information for a single activity, as raw JSON.
    pub async fn get_activity(&self, athlete_id: i64, activity_id: i64) -> Result<String> {
        self.authed_get(athlete_id, &format!("/activities/{activity_id}"))
            .await
    }

    /// Fetch one page of the athlete's activity ids. `has_more` is true when
    /// the page came back full; callers iterate from page 1 until it is
    /// false or a page is empty.
    pub async fn list_activities(
        &self,
        athlete_id: i64,
        page: i64,
        per_page: i64,
    ) -> Result<(Vec<i64>, bool)> {
        #[derive(Deserialize)]
        struct ActivitySummary {
            id: i64,
        }

        let body = self
            .authed_get(
                athlete_id,
                &format!("/athlete/activities?page={page}&per_page={per_page}"),
            )
            .await?;

        let summaries: Vec<ActivitySummary> = serde_json::from_str(&body)?;
        let has_more = summaries.len() as i64 == per_page;
        let ids = summaries.into_iter().map(|s| s.id).collect();

        Ok((ids, has_more))
    }

    /// Authenticated GET returning the raw response body. Ensures a fresh
    /// token first and feeds rate-limit headers into the shared counters.
    async fn authed_get(&self, athlete_id: i64, path: &str) -> Result<String> {
        let athlete = self
            .db
            .get_athlete(athlete_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("athlete {athlete_id} not connected")))?;

        let token = self.ensure_fresh_token(&athlete).await?;

        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).bearer_auth(&token).send().await?;

        self.ingest_rate_limit_headers(response.headers());

        let status = response.status();
        tracing::debug!(path, status = status.as_u16(), athlete_id, "strava request");

        if status.is_success() {
            return Ok(response.text().await?);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }

    /// Return an access token for the athlete, refreshing first if it
    /// expires within the slack window. Refresh is serialized per athlete;
    /// the loser of the race re-reads the rotated tokens instead of
    /// refreshing again.
    async fn ensure_fresh_token(&self, athlete: &Athlete) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        if athlete.token_expires_at - now > TOKEN_REFRESH_SLACK_SECS {
            return Ok(athlete.access_token.clone());
        }

        let lock = self
            .refresh_locks
            .entry(athlete.athlete_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another task may have rotated the tokens while we waited.
        let current = self
            .db
            .get_athlete(athlete.athlete_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("athlete {} not connected", athlete.athlete_id)))?;

        let now = chrono::Utc::now().timestamp();
        if current.token_expires_at - now > TOKEN_REFRESH_SLACK_SECS {
            return Ok(current.access_token);
        }

        tracing::info!(athlete_id = current.athlete_id, "refreshing athlete tokens");

        let (client_id, client_secret) = self.client_credentials(&current.credential_set)?;
        let token = self
            .request_token(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", current.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .await?;

        self.db
            .update_athlete_tokens(
                current.athlete_id,
                &token.access_token,
                &token.refresh_token,
                token.expires_at,
            )
            .await?;

        Ok(token.access_token)
    }

    /// POST to the token endpoint. Non-2xx is a credential failure.
    async fn request_token(&self, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self.http.post(&self.token_url).form(form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::BadCredentials(format!("HTTP {status}: {body}")));
        }

        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Parse the four rate-limit headers, if present, into the shared
    /// counters. Each is a "15min,daily" pair.
    fn ingest_rate_limit_headers(&self, headers: &HeaderMap) {
        if let (Some(limit), Some(usage)) = (
            parse_pair_header(headers, "x-ratelimit-limit"),
            parse_pair_header(headers, "x-ratelimit-usage"),
        ) {
            self.limits.set_overall(limit.0, usage.0, limit.1, usage.1);
        }

        if let (Some(limit), Some(usage)) = (
            parse_pair_header(headers, "x-readratelimit-limit"),
            parse_pair_header(headers, "x-readratelimit-usage"),
        ) {
            self.limits.set_read(limit.0, usage.0, limit.1, usage.1);
            tracing::debug!(
                read_usage_15min = usage.0,
                read_limit_15min = limit.0,
                read_usage_daily = usage.1,
                read_limit_daily = limit.1,
                "rate limit headers"
            );
        }
    }

    fn client_credentials(&self, name: &str) -> Result<(String, String)> {
        let creds = self
            .config
            .credential_set(name)
            .ok_or_else(|| AppError::BadRequest(format!("unknown credential set: {name}")))?;
        Ok((creds.client_id.clone(), creds.client_secret.clone()))
    }

    // --- Webhook subscription management (CLI only) ---

    /// Create a webhook subscription. App credentials only; no athlete auth.
    pub async fn create_subscription(
        &self,
        callback_url: &str,
        verify_token: &str,
        credential_set: &str,
    ) -> Result<Subscription> {
        let (client_id, client_secret) = self.client_credentials(credential_set)?;

        let response = self
            .http
            .post(format!("{}/push_subscriptions", self.base_url))
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("callback_url", callback_url),
                ("verify_token", verify_token),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_status(status, body));
        }

        Ok(serde_json::from_str(&body)?)
    }

    /// List active webhook subscriptions for the named credential set.
    pub async fn list_subscriptions(&self, credential_set: &str) -> Result<Vec<Subscription>> {
        let (client_id, client_secret) = self.client_credentials(credential_set)?;

        let response = self
            .http
            .get(format!("{}/push_subscriptions", self.base_url))
            .query(&[("client_id", client_id.as_str()), ("client_secret", client_secret.as_str())])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_status(status, body));
        }

        Ok(serde_json::from_str(&body)?)
    }

    /// Delete a webhook subscription by id.
    pub async fn delete_subscription(&self, subscription_id: i64, credential_set: &str) -> Result<()> {
        let (client_id, client_secret) = self.client_credentials(credential_set)?;

        let response = self
            .http
            .delete(format!("{}/push_subscriptions/{subscription_id}", self.base_url))
            .query(&[("client_id", client_id.as_str()), ("client_secret", client_secret.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        Ok(())
    }

    /// Retrieve one webhook subscription by id.
    pub async fn view_subscription(
        &self,
        subscription_id: i64,
        credential_set: &str,
    ) -> Result<Subscription> {
        let (client_id, client_secret) = self.client_credentials(credential_set)?;

        let response = self
            .http
            .get(format!("{}/push_subscriptions/{subscription_id}", self.base_url))
            .query(&[("client_id", client_id.as_str()), ("client_secret", client_secret.as_str())])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_status(status, body));
        }

        Ok(serde_json::from_str(&body)?)
    }
}

/// Map a non-2xx Strava status to a typed error, keeping the raw body for
/// diagnostics.
fn classify_status(status: StatusCode, body: String) -> AppError {
    match status.as_u16() {
        401 => AppError::Unauthorized,
        403 => AppError::Forbidden,
        404 => AppError::NotFound(body),
        429 => AppError::RateLimited,
        code => AppError::ServerError { status: code, body },
    }
}

/// Response from a token exchange or refresh.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    /// Athlete summary blob, present on code exchange but not on refresh.
    #[serde(default)]
    pub athlete: Option<Box<RawValue>>,
}

/// A Strava webhook subscription.
#[derive(Debug, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub application_id: i64,
    pub callback_url: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Parse a "15min,daily" header pair into two integers.
fn parse_pair_header(headers: &HeaderMap, name: &str) -> Option<(i64, i64)> {
    let raw = headers.get(name)?.to_str().ok()?;
    let (first, second) = raw.split_once(',')?;
    Some((first.trim().parse().ok()?, second.trim().parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn pair_header_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-limit", HeaderValue::from_static("600,30000"));
        assert_eq!(parse_pair_header(&headers, "x-ratelimit-limit"), Some((600, 30000)));
        assert_eq!(parse_pair_header(&headers, "x-ratelimit-usage"), None);

        headers.insert("x-readratelimit-usage", HeaderValue::from_static(" 42 , 137 "));
        assert_eq!(parse_pair_header(&headers, "x-readratelimit-usage"), Some((42, 137)));

        headers.insert("x-ratelimit-usage", HeaderValue::from_static("nonsense"));
        assert_eq!(parse_pair_header(&headers, "x-ratelimit-usage"), None);
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, String::new()),
            AppError::Unauthorized
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            AppError::RateLimited
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, String::new()),
            AppError::ServerError { status: 502, .. }
        ));
    }
}
