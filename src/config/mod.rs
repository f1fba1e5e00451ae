//! Configuration module for the keygate service

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::RateSpec;

/// Main application settings
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub auth: AuthSettings,
    pub usage: UsageSettings,
    pub maintenance: MaintenanceSettings,
    pub admin: AdminSettings,
    /// Statically configured keys, consulted when a key is not in the store
    pub legacy_keys: Vec<LegacyKeyConfig>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub workers: Option<usize>,
}

/// Database configuration for PostgreSQL
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Empty runs the in-memory stores
    pub url: String,
    pub max_connections: Option<usize>,
}

/// How the reset time reported with a quota denial is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuotaResetHint {
    /// Now plus 24 hours
    #[default]
    Rolling24h,
    /// Next UTC midnight, matching the daily reset job
    NextMidnight,
}

/// Authorization and rate-limit settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Placed in every denial body
    pub creator: String,
    pub require_apikey: bool,
    pub token_prefix: String,
    pub default_daily_limit: u32,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window_secs: u64,
    pub max_tracked_clients: usize,
    pub quota_reset_hint: QuotaResetHint,
    pub public_paths: Vec<String>,
}

impl AuthSettings {
    /// Short-window allowance per (key, address)
    pub fn key_rate(&self) -> RateSpec {
        RateSpec::per_window(
            self.rate_limit_max_requests,
            Duration::from_secs(self.rate_limit_window_secs),
        )
    }
}

/// Usage telemetry settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UsageSettings {
    pub log_retention_hours: i64,
    pub error_text_limit: usize,
    pub recent_log_limit: usize,
}

/// Scheduled maintenance settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    pub enabled: bool,
    pub expiry_interval_hours: u64,
    pub reconcile_interval_days: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AdminSettings {
    /// Empty disables the admin routes
    pub token: String,
}

/// One statically configured key, written as a `[[legacy_keys]]` table
///
/// The token is a value rather than a table name so its case survives loading.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyKeyConfig {
    pub key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// `"unlimited"` or `"<N>/<minute|hour|day>"`, rejected at load time if malformed
    pub rate_limit: RateSpec,
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Load configuration from files and environment variables
    ///
    /// Configuration priority (highest to lowest):
    /// 1. Environment variables (prefixed with KEYGATE__)
    /// 2. config/local.toml (gitignored)
    /// 3. config/default.toml
    pub fn load() -> Result<Self, ConfigError> {
        let config_dir = std::env::var("CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"));

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local overrides (gitignored)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // Add environment variables (KEYGATE__AUTH__CREATOR, etc.)
            .add_source(environment());

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.rate_limit_max_requests == 0 || self.auth.rate_limit_window_secs == 0 {
            return Err(ConfigError::Message(
                "auth.rate_limit_max_requests and auth.rate_limit_window_secs must be positive"
                    .to_string(),
            ));
        }
        if crate::domain::api_key::validate_daily_limit(self.auth.default_daily_limit).is_err() {
            return Err(ConfigError::Message(format!(
                "auth.default_daily_limit {} is out of range",
                self.auth.default_daily_limit
            )));
        }
        if let Some(blank) = self.legacy_keys.iter().find(|k| k.key.trim().is_empty()) {
            return Err(ConfigError::Message(format!(
                "legacy key with rate limit {} has an empty key",
                blank.rate_limit
            )));
        }
        if self.usage.log_retention_hours <= 0 {
            return Err(ConfigError::Message(
                "usage.log_retention_hours must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// `KEYGATE__<SECTION>__<FIELD>`, e.g. `KEYGATE__AUTH__CREATOR`
fn environment() -> Environment {
    Environment::with_prefix("KEYGATE")
        .separator("__")
        .try_parsing(true)
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            host: "0.0.0.0".to_string(),
            port: 8080,
            workers: None,
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            url: String::new(),
            max_connections: Some(10),
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        AuthSettings {
            creator: "keygate".to_string(),
            require_apikey: true,
            token_prefix: "kg_".to_string(),
            default_daily_limit: 1_000,
            rate_limit_max_requests: 60,
            rate_limit_window_secs: 60,
            max_tracked_clients: 100_000,
            quota_reset_hint: QuotaResetHint::default(),
            public_paths: vec![
                "/health".to_string(),
                "/swagger-ui".to_string(),
                "/api-docs".to_string(),
                "/admin".to_string(),
            ],
        }
    }
}

impl Default for UsageSettings {
    fn default() -> Self {
        UsageSettings {
            log_retention_hours: 24,
            error_text_limit: 500,
            recent_log_limit: 50,
        }
    }
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        MaintenanceSettings {
            enabled: true,
            expiry_interval_hours: 6,
            reconcile_interval_days: 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(toml: &str) -> Result<Settings, ConfigError> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let settings = from_toml("").unwrap();
        assert_eq!(settings.server.port, 8080);
        assert!(settings.database.url.is_empty());
        assert_eq!(settings.auth.rate_limit_max_requests, 60);
        assert_eq!(settings.auth.quota_reset_hint, QuotaResetHint::Rolling24h);
        assert_eq!(settings.usage.log_retention_hours, 24);
        assert!(settings.legacy_keys.is_empty());
    }

    #[test]
    fn test_legacy_keys_are_parsed_at_load() {
        let settings = from_toml(
            r#"
            [[legacy_keys]]
            key = "partner"
            rate_limit = "unlimited"

            [[legacy_keys]]
            key = "trial"
            enabled = false
            rate_limit = "10/hour"
            "#,
        )
        .unwrap();

        let partner = &settings.legacy_keys[0];
        assert_eq!(partner.key, "partner");
        assert!(partner.enabled);
        assert_eq!(partner.rate_limit, RateSpec::Unlimited);

        let trial = &settings.legacy_keys[1];
        assert!(!trial.enabled);
        assert_eq!(
            trial.rate_limit,
            RateSpec::per_window(10, Duration::from_secs(3600))
        );
    }

    #[test]
    fn test_legacy_key_case_is_preserved() {
        let settings = from_toml(
            r#"
            [[legacy_keys]]
            key = "PartnerKey_X9"
            rate_limit = "5/minute"
            "#,
        )
        .unwrap();

        assert_eq!(settings.legacy_keys[0].key, "PartnerKey_X9");
        let legacy = crate::auth::LegacyKeys::new(settings.legacy_keys);
        assert_eq!(
            legacy.lookup("PartnerKey_X9"),
            Some(RateSpec::per_window(5, Duration::from_secs(60)))
        );
        assert_eq!(legacy.lookup("partnerkey_x9"), None);
    }

    #[test]
    fn test_malformed_legacy_rate_fails_load() {
        let result = from_toml(
            r#"
            [[legacy_keys]]
            key = "broken"
            rate_limit = "lots/minute"
            "#,
        );
        assert!(result.is_err());

        let result = from_toml("[[legacy_keys]]\nkey = \"\"\nrate_limit = \"unlimited\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_environment_overrides_use_double_underscore() {
        let vars: config::Map<String, String> = [
            ("KEYGATE__AUTH__CREATOR", "acme"),
            ("KEYGATE__SERVER__PORT", "9090"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let settings: Settings = Config::builder()
            .add_source(environment().source(Some(vars)))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(settings.auth.creator, "acme");
        assert_eq!(settings.server.port, 9090);
    }

    #[test]
    fn test_reset_hint_and_zero_window() {
        let settings = from_toml("[auth]\nquota_reset_hint = \"next_midnight\"\n").unwrap();
        assert_eq!(settings.auth.quota_reset_hint, QuotaResetHint::NextMidnight);

        assert!(from_toml("[auth]\nrate_limit_window_secs = 0\n").is_err());
        assert!(from_toml("[auth]\ndefault_daily_limit = 0\n").is_err());
    }
}
