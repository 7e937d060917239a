//! Configuration validation rules.
//!
//! Applied to `EngineConfig` after it has been loaded from environment,
//! files, or defaults.

use crate::config::EngineConfig;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

impl EngineConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(invalid("max_entries", "must be greater than 0"));
        }

        if self.ttl_ms == 0 {
            return Err(invalid("ttl_ms", "must be at least 1ms"));
        }

        if self.fetch_timeout_ms == Some(0) {
            return Err(invalid("fetch_timeout_ms", "must be at least 1ms when set"));
        }

        if self.retry.max_retries > 20 {
            return Err(invalid("retry.max_retries", "must not exceed 20"));
        }
        if self.retry.delay_ms > 300_000 {
            return Err(invalid("retry.delay_ms", "must not exceed 5 minutes (300000ms)"));
        }
        if self.retry.max_delay_ms < self.retry.delay_ms {
            return Err(invalid("retry.max_delay_ms", "must be greater than or equal to retry.delay_ms"));
        }

        if self.db_pool_size == 0 || self.db_pool_size > 64 {
            return Err(invalid("db_pool_size", "must be between 1 and 64"));
        }

        if self.http.user_agent.is_empty() {
            return Err(invalid("http.user_agent", "must not be empty"));
        }
        if self.http.timeout_ms < 100 {
            return Err(invalid("http.timeout_ms", "must be at least 100ms"));
        }
        if self.http.timeout_ms > 300_000 {
            return Err(invalid("http.timeout_ms", "must not exceed 5 minutes (300000ms)"));
        }

        if self.ttl_ms < 1000 && self.sweep_enabled {
            tracing::warn!(ttl_ms = self.ttl_ms, "ttl below one second; the expiry sweep will run very frequently");
        }

        Ok(())
    }
}
