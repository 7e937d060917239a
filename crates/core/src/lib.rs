//! Data-caching, revalidation and transaction engine.
//!
//! This crate provides:
//! - A bounded in-memory cache with stale-while-revalidate reads and
//!   per-key request deduplication
//! - Subscriptions to cache entry changes
//! - Optimistic mutations
//! - Transactions with rollback/retry strategies
//! - A SQLite data source
//! - Unified error types and layered configuration

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod mutation;
pub mod retry;
pub mod revalidation;
pub mod sql;
pub mod subscription;
pub mod transaction;

pub use cache::{CacheConfig, CacheEntry, CacheKey, CacheStats, CacheStore, Status};
pub use config::{ConfigError, EngineConfig};
pub use engine::Engine;
pub use error::{Error, ErrorKind};
pub use fetcher::{Fetcher, fetcher_fn};
pub use mutation::{MutationCoordinator, MutationOptions};
pub use retry::{Backoff, RetryPolicy};
pub use revalidation::{QueryClient, QueryOptions};
pub use subscription::{Subscription, SubscriptionBus};
pub use transaction::{
    ConnectionProvider, TransactionConnection, TransactionContext, TransactionOptions, TransactionRunner,
    TransactionStrategy,
};
