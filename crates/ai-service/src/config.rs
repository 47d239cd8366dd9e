//! Environment-driven configuration for the resilience layer

use crate::backend::StoredCredentials;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::factory::{FactoryConfig, ServiceOptions};
use crate::monitor::MonitorConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Complete configuration for one process-scoped
/// [`AiService`](crate::service::AiService) instance.
#[derive(Debug, Clone)]
pub struct AiServiceConfig {
    pub options: ServiceOptions,
    pub factory: FactoryConfig,
    pub breaker: CircuitBreakerConfig,
    pub monitor: MonitorConfig,
}

impl Default for AiServiceConfig {
    fn default() -> Self {
        Self {
            options: ServiceOptions::new("bedrock", "anthropic.claude-3-sonnet-20240229-v1:0"),
            factory: FactoryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl AiServiceConfig {
    /// Build configuration from the environment, loading `.env` if present.
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let mut config = Self::default();

        if let Ok(model) = env::var("BEDROCK_MODEL_ID") {
            config.options.model = model;
        }
        if let Ok(region) = env::var("BEDROCK_REGION") {
            config.options.region = Some(region);
        }
        if let (Ok(access_key_id), Ok(secret_access_key)) = (
            env::var("AI_STORED_ACCESS_KEY_ID"),
            env::var("AI_STORED_SECRET_ACCESS_KEY"),
        ) {
            config.options.stored_credentials = Some(StoredCredentials {
                access_key_id,
                secret_access_key,
            });
        }

        config.factory.instance_ttl =
            env_duration_ms("AI_INSTANCE_TTL_MS", config.factory.instance_ttl);
        config.factory.eviction_interval =
            env_duration_ms("AI_EVICTION_INTERVAL_MS", config.factory.eviction_interval);

        config.breaker.failure_threshold =
            env_parse("AI_FAILURE_THRESHOLD", config.breaker.failure_threshold);
        config.breaker.operation_timeout =
            env_duration_ms("AI_OPERATION_TIMEOUT_MS", config.breaker.operation_timeout);
        config.breaker.recovery_timeout =
            env_duration_ms("AI_RECOVERY_TIMEOUT_MS", config.breaker.recovery_timeout);

        config.monitor.check_interval =
            env_duration_ms("AI_HEALTH_CHECK_INTERVAL_MS", config.monitor.check_interval);
        config.monitor.failure_rate_threshold = env_parse(
            "AI_FAILURE_RATE_THRESHOLD",
            config.monitor.failure_rate_threshold,
        );

        config
    }
}

fn env_duration_ms(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AiServiceConfig::default();
        assert_eq!(config.options.provider, "bedrock");
        assert_eq!(config.breaker.failure_threshold, 5);
        assert!(config.factory.eviction_interval < config.factory.instance_ttl);
    }

    #[test]
    fn test_env_overrides_and_bad_values() {
        env::set_var("AI_FAILURE_THRESHOLD", "7");
        env::set_var("AI_OPERATION_TIMEOUT_MS", "not-a-number");

        let config = AiServiceConfig::from_env();
        assert_eq!(config.breaker.failure_threshold, 7);
        // Unparsable values keep the default.
        assert_eq!(
            config.breaker.operation_timeout,
            CircuitBreakerConfig::default().operation_timeout
        );

        env::remove_var("AI_FAILURE_THRESHOLD");
        env::remove_var("AI_OPERATION_TIMEOUT_MS");
    }
}
