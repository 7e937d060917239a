//! In-memory query cache.
//!
//! - Deterministic keys derived from resource name and parameters
//! - Bounded store with hybrid hit-count/recency eviction and TTL sweep
//! - Per-key request deduplication

pub mod dedup;
pub mod entry;
pub mod key;
pub mod stats;
pub mod store;

use std::time::Duration;

pub use dedup::{InFlightResult, RequestDeduplicator};
pub use entry::{CacheEntry, Status};
pub use key::CacheKey;
pub use stats::CacheStats;
pub use store::CacheStore;

/// Settings for the cache and its revalidation behavior.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries held by the store.
    pub max_entries: usize,
    /// Freshness window; also the sweep interval.
    pub ttl: Duration,
    /// Serve stale data while refreshing in the background.
    pub stale_while_revalidate: bool,
    /// Keep last good data on an entry whose refresh failed.
    pub keep_previous_data: bool,
    /// Upper bound for one fetch, retries included.
    pub fetch_timeout: Option<Duration>,
    /// Run the periodic expiry sweep.
    pub sweep: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl: Duration::from_secs(300),
            stale_while_revalidate: true,
            keep_previous_data: true,
            fetch_timeout: None,
            sweep: true,
        }
    }
}
