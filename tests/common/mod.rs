// SPDX-License-Identifier: MIT

use std::sync::Arc;

use strava_relay::{
    config::Config,
    db::Store,
    routes,
    services::{OauthManager, StravaClient},
    AppState,
};

/// Create an in-memory test database.
pub async fn test_store() -> Store {
    Store::open(":memory:").await.expect("failed to open in-memory store")
}

/// Create a test app with an in-memory store and the default test config.
/// No Strava traffic is expected; handlers that enqueue or read never touch
/// the network.
pub async fn test_app() -> (axum::Router, Store) {
    let config = Config::test_default();
    let db = test_store().await;

    let strava = Arc::new(StravaClient::new(config.clone(), db.clone()));
    let oauth = Arc::new(OauthManager::new(config.clone(), db.clone(), strava));

    let state = Arc::new(AppState {
        config,
        db: db.clone(),
        oauth,
    });

    (routes::create_router(state), db)
}
