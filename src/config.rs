//! Application configuration loaded from environment variables.
//!
//! A `.env` file is honored for local development; real environments set the
//! variables directly. At least one Strava credential set (`primary`) must be
//! configured; an optional `secondary` set allows migrating between Strava
//! application registrations without dropping webhooks.

use std::collections::HashMap;
use std::env;

/// One Strava application registration.
#[derive(Debug, Clone)]
pub struct CredentialSet {
    /// Strava OAuth client ID (public)
    pub client_id: String,
    /// Strava OAuth client secret
    pub client_secret: String,
    /// Webhook subscription verify token
    pub verify_token: String,
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen host for the HTTP server
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Path to the SQLite database file
    pub database_path: String,
    /// Log level: debug, info, warn or error
    pub log_level: String,

    /// Public domain this relay is served under (used for callback URLs)
    pub domain: String,
    /// Shared secret for the internal /events API
    pub internal_api_key: String,

    /// Strava credential sets, keyed by name ("primary", "secondary")
    pub credential_sets: HashMap<String, CredentialSet>,

    /// Metrics exposition knobs (read by the deployment, not served here)
    pub metrics_enabled: bool,
    pub metrics_host: String,
    pub metrics_port: u16,

    /// Fraction of the read budget reserved for real-time webhooks
    pub webhook_reserve: f64,
    /// Read-bucket usage fraction above which backfill is throttled
    pub throttle_threshold: f64,
    /// Consecutive successes required to close a half-open circuit
    pub circuit_recovery_count: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let mut credential_sets = HashMap::new();
        credential_sets.insert("primary".to_string(), load_credential_set("PRIMARY")?);
        if let Some(secondary) = load_optional_credential_set("SECONDARY")? {
            credential_sets.insert("secondary".to_string(), secondary);
        }

        let config = Self {
            host: get_env("HOST", "127.0.0.1"),
            port: get_env_parsed("PORT", 4101)?,
            database_path: get_env("DATABASE_PATH", "./data.db"),
            log_level: get_env("LOG_LEVEL", "info"),
            domain: env::var("DOMAIN").map_err(|_| ConfigError::Missing("DOMAIN"))?,
            internal_api_key: env::var("INTERNAL_API_KEY")
                .map_err(|_| ConfigError::Missing("INTERNAL_API_KEY"))?,
            credential_sets,
            metrics_enabled: get_env("METRICS_ENABLED", "false") == "true",
            metrics_host: get_env("METRICS_HOST", "127.0.0.1"),
            metrics_port: get_env_parsed("METRICS_PORT", 4102)?,
            webhook_reserve: get_env_parsed("RATE_LIMIT_WEBHOOK_RESERVE", 0.20)?,
            throttle_threshold: get_env_parsed("RATE_LIMIT_THROTTLE_THRESHOLD", 0.70)?,
            circuit_recovery_count: get_env_parsed("CIRCUIT_RECOVERY_COUNT", 3)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check that all configuration values are in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("PORT must be between 1 and 65535"));
        }
        if !matches!(self.log_level.as_str(), "debug" | "info" | "warn" | "error") {
            return Err(ConfigError::Invalid(
                "LOG_LEVEL must be one of: debug, info, warn, error",
            ));
        }
        if !(0.0..=1.0).contains(&self.webhook_reserve) {
            return Err(ConfigError::Invalid(
                "RATE_LIMIT_WEBHOOK_RESERVE must be between 0 and 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.throttle_threshold) {
            return Err(ConfigError::Invalid(
                "RATE_LIMIT_THROTTLE_THRESHOLD must be between 0 and 1",
            ));
        }
        if self.circuit_recovery_count == 0 {
            return Err(ConfigError::Invalid(
                "CIRCUIT_RECOVERY_COUNT must be at least 1",
            ));
        }
        Ok(())
    }

    /// Look up a credential set by name.
    pub fn credential_set(&self, name: &str) -> Option<&CredentialSet> {
        self.credential_sets.get(name)
    }

    pub fn has_credential_set(&self, name: &str) -> bool {
        self.credential_sets.contains_key(name)
    }

    /// The credential set used when the caller does not name one.
    pub fn default_credential_set(&self) -> &'static str {
        "primary"
    }

    /// Names of all configured credential sets.
    pub fn credential_set_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.credential_sets.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Default config for testing only.
    pub fn test_default() -> Self {
        let mut credential_sets = HashMap::new();
        credential_sets.insert(
            "primary".to_string(),
            CredentialSet {
                client_id: "cid".to_string(),
                client_secret: "sec".to_string(),
                verify_token: "test_verify_token".to_string(),
            },
        );
        Self {
            host: "127.0.0.1".to_string(),
            port: 4101,
            database_path: ":memory:".to_string(),
            log_level: "info".to_string(),
            domain: "relay.example.com".to_string(),
            internal_api_key: "test_api_key".to_string(),
            credential_sets,
            metrics_enabled: false,
            metrics_host: "127.0.0.1".to_string(),
            metrics_port: 4102,
            webhook_reserve: 0.20,
            throttle_threshold: 0.70,
            circuit_recovery_count: 3,
        }
    }
}

/// Load a required credential set from `STRAVA_<PREFIX>_*` variables.
fn load_credential_set(prefix: &str) -> Result<CredentialSet, ConfigError> {
    load_optional_credential_set(prefix)?.ok_or(ConfigError::MissingCredentialSet(
        // The error names the first variable of the triple for actionability.
        match prefix {
            "PRIMARY" => "STRAVA_PRIMARY_CLIENT_ID",
            _ => "STRAVA_SECONDARY_CLIENT_ID",
        },
    ))
}

/// Load a credential set if any of its variables are present.
///
/// A partially configured set (some variables but not all three) is an error
/// rather than a silently half-working registration.
fn load_optional_credential_set(prefix: &str) -> Result<Option<CredentialSet>, ConfigError> {
    let client_id = env::var(format!("STRAVA_{prefix}_CLIENT_ID")).ok();
    let client_secret = env::var(format!("STRAVA_{prefix}_CLIENT_SECRET")).ok();
    let verify_token = env::var(format!("STRAVA_{prefix}_VERIFY_TOKEN")).ok();

    match (client_id, client_secret, verify_token) {
        (Some(client_id), Some(client_secret), Some(verify_token)) => Ok(Some(CredentialSet {
            client_id: client_id.trim().to_string(),
            client_secret: client_secret.trim().to_string(),
            verify_token: verify_token.trim().to_string(),
        })),
        (None, None, None) => Ok(None),
        _ => Err(ConfigError::PartialCredentialSet(match prefix {
            "PRIMARY" => "primary",
            _ => "secondary",
        })),
    }
}

/// Retrieve an environment variable or return a default value.
fn get_env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Retrieve an environment variable parsed as `T`, or a default.
fn get_env_parsed<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Unparseable(key)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Missing required credential set (set {0} and its companions)")]
    MissingCredentialSet(&'static str),

    #[error("Credential set '{0}' is only partially configured")]
    PartialCredentialSet(&'static str),

    #[error("Environment variable {0} could not be parsed")]
    Unparseable(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        Config::test_default().validate().expect("test config");
    }

    #[test]
    fn credential_set_lookup() {
        let config = Config::test_default();
        assert!(config.has_credential_set("primary"));
        assert!(!config.has_credential_set("secondary"));
        assert_eq!(config.credential_set("primary").unwrap().client_id, "cid");
        assert_eq!(config.default_credential_set(), "primary");
    }

    #[test]
    fn validate_rejects_bad_threshold() {
        let mut config = Config::test_default();
        config.throttle_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_log_level() {
        let mut config = Config::test_default();
        config.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_recovery_count() {
        let mut config = Config::test_default();
        config.circuit_recovery_count = 0;
        assert!(config.validate().is_err());
    }
}
