// SPDX-License-Identifier: MIT

//! Strava OAuth flow routes.

use crate::error::{AppError, Result};
use crate::AppState;
use axum::{
    extract::{Query, State},
    response::{Html, IntoResponse, Redirect},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/oauth-start", get(oauth_start))
        .route("/oauth-callback", get(oauth_callback))
}

#[derive(Deserialize)]
struct StartParams {
    #[serde(default)]
    credential_set: Option<String>,
}

/// Start the OAuth flow: issue a state nonce and redirect to Strava.
async fn oauth_start(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StartParams>,
) -> Result<impl IntoResponse> {
    let credential_set = params
        .credential_set
        .as_deref()
        .unwrap_or_else(|| state.config.default_credential_set());

    // Callback URL comes from configuration, never from request headers.
    let redirect_uri = format!("https://{}/oauth-callback", state.config.domain);

    let (auth_url, _) = state.oauth.start(&redirect_uri, credential_set)?;

    tracing::info!(credential_set, "starting OAuth flow, redirecting to Strava");

    Ok(Redirect::temporary(&auth_url))
}

#[derive(Deserialize)]
struct CallbackParams {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// OAuth callback: exchange the code, store the athlete, render a terminal
/// page.
async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Result<impl IntoResponse> {
    if let Some(error) = params.error {
        tracing::warn!(error = %error, "OAuth authorization denied");
        return Err(AppError::BadRequest(format!("Authorization failed: {error}")));
    }

    let (Some(code), Some(nonce)) = (params.code, params.state) else {
        tracing::warn!("OAuth callback missing code or state");
        return Err(AppError::BadRequest(
            "Missing code or state parameter".to_string(),
        ));
    };

    let (athlete_id, credential_set) = state.oauth.complete(&code, &nonce).await?;

    tracing::info!(athlete_id, %credential_set, "OAuth flow completed");

    Ok(Html(success_page(athlete_id)))
}

/// Terminal page shown after a successful authorization.
fn success_page(athlete_id: i64) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Authorization Successful</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Helvetica, Arial, sans-serif;
            max-width: 600px;
            margin: 100px auto;
            padding: 20px;
            text-align: center;
        }}
        h1 {{ color: #FC4C02; }}
        p {{ color: #666; line-height: 1.6; }}
        code {{
            background: #f4f4f4;
            padding: 2px 6px;
            border-radius: 3px;
            font-family: monospace;
        }}
    </style>
</head>
<body>
    <h1>&#10003; Authorization Successful</h1>
    <p>Your Strava account has been connected (Athlete ID: <code>{athlete_id}</code>)</p>
    <p>Historical activities are now being synced in the background.</p>
    <p>You can close this window and return to your application.</p>
</body>
</html>"#
    )
}
