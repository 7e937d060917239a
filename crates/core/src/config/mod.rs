//! Engine configuration with layered loading.
//!
//! Uses figment to merge, in order of increasing precedence:
//!
//! 1. Built-in defaults
//! 2. TOML config file (if QUIRE_CONFIG_FILE set)
//! 3. Environment variables (QUIRE_*, nested keys split on `__`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::retry::{Backoff, RetryPolicy};

mod validation;

pub use validation::ConfigError;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of entries held by the cache store.
    ///
    /// Set via QUIRE_MAX_ENTRIES.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Freshness window for cached entries, in milliseconds.
    ///
    /// Also the interval of the expiry sweep. Set via QUIRE_TTL_MS.
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,

    /// Serve stale entries while refreshing them in the background.
    ///
    /// Set via QUIRE_STALE_WHILE_REVALIDATE.
    #[serde(default = "default_true")]
    pub stale_while_revalidate: bool,

    /// Keep the last successful data on an entry whose refresh failed.
    ///
    /// Set via QUIRE_KEEP_PREVIOUS_DATA.
    #[serde(default = "default_true")]
    pub keep_previous_data: bool,

    /// Upper bound for a single fetch in milliseconds. Unbounded when unset.
    ///
    /// Set via QUIRE_FETCH_TIMEOUT_MS.
    #[serde(default)]
    pub fetch_timeout_ms: Option<u64>,

    /// Run the periodic expiry sweep.
    ///
    /// Set via QUIRE_SWEEP_ENABLED.
    #[serde(default = "default_true")]
    pub sweep_enabled: bool,

    /// Retry settings shared by fetches and transactions.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Path to the SQLite database used by the SQL data source.
    ///
    /// Set via QUIRE_DB_PATH.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Number of connections handed out to transactions.
    ///
    /// Set via QUIRE_DB_POOL_SIZE.
    #[serde(default = "default_pool_size")]
    pub db_pool_size: usize,

    /// HTTP data source settings.
    #[serde(default)]
    pub http: HttpConfig,
}

/// Retry settings. Set via QUIRE_RETRY__*.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between attempts in milliseconds.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// `fixed` or `exponential`.
    #[serde(default)]
    pub backoff: BackoffKind,

    /// Cap for exponential delays in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Backoff shape as written in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    #[default]
    Exponential,
}

/// HTTP data source settings. Set via QUIRE_HTTP__*.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Base URL that resource paths are resolved against.
    #[serde(default)]
    pub base_url: Option<String>,

    /// User-Agent header for outgoing requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_max_entries() -> usize {
    1000
}

fn default_ttl_ms() -> u64 {
    300_000
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./quire.sqlite")
}

fn default_pool_size() -> usize {
    4
}

fn default_user_agent() -> String {
    "quire/0.1".into()
}

fn default_http_timeout_ms() -> u64 {
    20_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_ms: default_delay_ms(),
            backoff: BackoffKind::default(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { base_url: None, user_agent: default_user_agent(), timeout_ms: default_http_timeout_ms() }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            ttl_ms: default_ttl_ms(),
            stale_while_revalidate: true,
            keep_previous_data: true,
            fetch_timeout_ms: None,
            sweep_enabled: true,
            retry: RetryConfig::default(),
            db_path: default_db_path(),
            db_pool_size: default_pool_size(),
            http: HttpConfig::default(),
        }
    }
}

impl RetryConfig {
    /// Build the retry policy described by this configuration.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.delay()).with_backoff(self.backoff())
    }

    /// Delay before the first retry.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn backoff(&self) -> Backoff {
        match self.backoff {
            BackoffKind::Fixed => Backoff::Fixed,
            BackoffKind::Exponential => Backoff::Exponential { max_delay: Duration::from_millis(self.max_delay_ms) },
        }
    }
}

impl HttpConfig {
    /// Timeout as Duration for use with reqwest.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl EngineConfig {
    /// Freshness window as a Duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Fetch timeout as a Duration, if bounded.
    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }

    /// Cache settings derived from this configuration.
    pub fn cache(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.max_entries,
            ttl: self.ttl(),
            stale_while_revalidate: self.stale_while_revalidate,
            keep_previous_data: self.keep_previous_data,
            fetch_timeout: self.fetch_timeout(),
            sweep: self.sweep_enabled,
        }
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read, a variable cannot
    /// be parsed, or validation fails after loading.
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var_os("QUIRE_CONFIG_FILE").map(PathBuf::from);
        Self::load_from(file.as_deref())
    }

    /// Like [`load`](Self::load) with an explicit TOML file in place of
    /// QUIRE_CONFIG_FILE.
    pub fn load_from(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(
            Env::prefixed("QUIRE_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        Self::extract(figment)
    }

    /// Extract and validate a configuration from a prepared figment.
    pub fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
