// SPDX-License-Identifier: MIT

//! Strava-Relay: durable ingestion relay between Strava and a downstream
//! consumer.
//!
//! Webhook notifications and OAuth completions are converted into a single
//! ordered, cursor-addressable event log. Raw notifications are hydrated by
//! fetching the referenced activity from the Strava API under shared
//! rate-limit budgets, with bounded retries and revocation-induced purges.

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod services;
pub mod worker;

use std::sync::Arc;

use config::Config;
use db::Store;
use services::OauthManager;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub db: Store,
    pub oauth: Arc<OauthManager>,
}
