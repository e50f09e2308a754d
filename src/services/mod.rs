// SPDX-License-Identifier: MIT

//! Services module - business logic layer.

pub mod oauth;
pub mod ratelimit;
pub mod strava;

pub use oauth::OauthManager;
pub use ratelimit::{calculate_cooldown, RateLimitStatus, RateLimits};
pub use strava::{StravaClient, Subscription, TokenResponse};
