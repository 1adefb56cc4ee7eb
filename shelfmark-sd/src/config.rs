//! Configuration for shelfmark-sd
//!
//! Loaded from the shared TOML config file with environment-variable
//! overrides for deployment-sensitive values (port, API key). Every knob
//! has a compiled default so the service runs with no config file at all.

use serde::Deserialize;
use std::time::Duration;

use crate::services::circuit_breaker::CircuitBreakerConfig;
use crate::services::description_classifier::ClassifierConfig;
use crate::services::enrichment::SchedulerConfig;
use crate::services::matcher::MatcherConfig;
use crate::services::retry::RetryPolicy;

/// Circuit breaker tuning, serde-friendly
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub base_cooldown_secs: u64,
    pub max_cooldown_secs: u64,
    pub cooldown_multiplier: f64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_cooldown_secs: 30,
            max_cooldown_secs: 300,
            cooldown_multiplier: 2.0,
        }
    }
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            base_cooldown: Duration::from_secs(self.base_cooldown_secs),
            max_cooldown: Duration::from_secs(self.max_cooldown_secs),
            cooldown_multiplier: self.cooldown_multiplier,
        }
    }
}

/// Retry/backoff tuning, serde-friendly
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 5000,
            multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.multiplier,
        }
    }
}

/// Daily provider ceilings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaSettings {
    /// Google Books requests per UTC day
    pub googlebooks_daily: i64,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            googlebooks_daily: 1000,
        }
    }
}

/// Full service configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP listen port
    pub port: u16,
    /// Pause between full enrichment runs
    pub enrichment_interval_secs: u64,
    /// Google Books API key (also SHELFMARK_GOOGLEBOOKS_API_KEY)
    pub googlebooks_api_key: Option<String>,
    pub quotas: QuotaSettings,
    pub breaker: BreakerSettings,
    pub retry: RetrySettings,
    pub matcher: MatcherConfig,
    pub scheduler: SchedulerConfig,
    pub classifier: ClassifierConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 5741,
            enrichment_interval_secs: 3600,
            googlebooks_api_key: None,
            quotas: QuotaSettings::default(),
            breaker: BreakerSettings::default(),
            retry: RetrySettings::default(),
            matcher: MatcherConfig::default(),
            scheduler: SchedulerConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration: TOML file if present, then env overrides
    pub fn load() -> Self {
        let mut config = match shelfmark_common::config::find_config_file() {
            Ok(path) => match std::fs::read_to_string(&path) {
                Ok(content) => match toml::from_str::<ServiceConfig>(&content) {
                    Ok(config) => {
                        tracing::info!(path = %path.display(), "Loaded config file");
                        config
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Invalid config file, using defaults");
                        ServiceConfig::default()
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Unreadable config file, using defaults");
                    ServiceConfig::default()
                }
            },
            Err(_) => ServiceConfig::default(),
        };

        if let Ok(key) = std::env::var("SHELFMARK_GOOGLEBOOKS_API_KEY") {
            if !key.trim().is_empty() {
                config.googlebooks_api_key = Some(key);
            }
        }
        if let Ok(port) = std::env::var("SHELFMARK_SD_PORT") {
            match port.parse() {
                Ok(port) => config.port = port,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid SHELFMARK_SD_PORT"),
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.port, 5741);
        assert_eq!(config.quotas.googlebooks_daily, 1000);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.scheduler.series_batch_size, 200);
        assert_eq!(config.scheduler.book_batch_size, 500);
    }

    #[test]
    fn test_parse_partial_toml() {
        let content = r#"
            port = 8080

            [quotas]
            googlebooks_daily = 250

            [breaker]
            failure_threshold = 3
            base_cooldown_secs = 10

            [matcher]
            auto_accept_threshold = 0.95
        "#;

        let config: ServiceConfig = toml::from_str(content).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.quotas.googlebooks_daily, 250);
        assert_eq!(config.breaker.failure_threshold, 3);
        // Unspecified fields keep their defaults
        assert_eq!(config.breaker.max_cooldown_secs, 300);
        assert_eq!(config.matcher.auto_accept_threshold, 0.95);
        assert_eq!(config.matcher.title_match_threshold, 0.85);
    }

    #[test]
    fn test_breaker_settings_conversion() {
        let settings = BreakerSettings::default();
        let config = settings.to_breaker_config();
        assert_eq!(config.base_cooldown, Duration::from_secs(30));
        assert_eq!(config.max_cooldown, Duration::from_secs(300));
    }
}
