// SPDX-License-Identifier: MIT

//! HTTP route handlers.

pub mod events;
pub mod oauth;
pub mod webhook;

use crate::AppState;
use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Health check: plain `OK` so probes don't need a JSON parser.
async fn health_check() -> &'static str {
    "OK"
}

/// Build the complete router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .merge(oauth::routes())
        .merge(webhook::routes())
        .merge(events::routes())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}
