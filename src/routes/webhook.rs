// SPDX-License-Identifier: MIT

//! Webhook callback routes, one path per credential set.

use crate::AppState;
use axum::{
    extract::{DefaultBodyLimit, Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Webhook routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/webhook-callback/{credential_set}",
            get(verify).post(handle_event),
        )
        // Strava payloads are small (<1KB), so 16KB is a safe conservative limit
        .layer(DefaultBodyLimit::max(16384))
}

/// Strava webhook verification query params.
#[derive(Deserialize)]
struct VerifyParams {
    #[serde(rename = "hub.mode")]
    mode: String,
    #[serde(rename = "hub.challenge")]
    challenge: String,
    #[serde(rename = "hub.verify_token")]
    verify_token: String,
}

/// Verification response.
#[derive(Serialize)]
struct VerifyResponse {
    #[serde(rename = "hub.challenge")]
    challenge: String,
}

/// Verify a webhook subscription (GET): echo the challenge iff the verify
/// token matches the credential set's configured token.
async fn verify(
    State(state): State<Arc<AppState>>,
    Path(credential_set): Path<String>,
    Query(params): Query<VerifyParams>,
) -> impl IntoResponse {
    let Some(creds) = state.config.credential_set(&credential_set) else {
        tracing::warn!(%credential_set, "webhook verification for unknown credential set");
        return (StatusCode::BAD_REQUEST, "Unknown credential set").into_response();
    };

    // Constant-time comparison to prevent timing attacks
    let token_matches = bool::from(
        params
            .verify_token
            .as_bytes()
            .ct_eq(creds.verify_token.as_bytes()),
    );

    if params.mode == "subscribe" && token_matches {
        tracing::info!(%credential_set, "webhook subscription verified");
        (
            StatusCode::OK,
            Json(VerifyResponse {
                challenge: params.challenge,
            }),
        )
            .into_response()
    } else {
        tracing::warn!(%credential_set, mode = %params.mode, "webhook verification failed");
        (StatusCode::FORBIDDEN, "Forbidden").into_response()
    }
}

/// Handle an incoming webhook event (POST): validate the JSON, enqueue the
/// raw body, and return 200 before any processing so Strava always sees a
/// healthy subscriber.
async fn handle_event(
    State(state): State<Arc<AppState>>,
    Path(credential_set): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    if !state.config.has_credential_set(&credential_set) {
        tracing::warn!(%credential_set, "webhook event for unknown credential set");
        return (StatusCode::BAD_REQUEST, "Unknown credential set");
    }

    let parsed: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(%credential_set, error = %err, "invalid JSON in webhook body");
            return (StatusCode::BAD_REQUEST, "Bad request");
        }
    };

    tracing::info!(
        %credential_set,
        object_type = ?parsed.get("object_type"),
        object_id = ?parsed.get("object_id"),
        aspect_type = ?parsed.get("aspect_type"),
        owner_id = ?parsed.get("owner_id"),
        "received webhook event"
    );

    let raw = String::from_utf8_lossy(&body);
    if let Err(err) = state.db.enqueue_webhook(&raw).await {
        tracing::error!(%credential_set, error = %err, "failed to enqueue webhook");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
    }

    (StatusCode::OK, "")
}
