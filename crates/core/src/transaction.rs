//! Begin/commit/rollback around a caller-supplied unit of work.
//!
//! Every attempt acquires its own connection from the provider, so
//! concurrent transactions never share a context. Under
//! [`TransactionStrategy::Retry`] the whole unit of work is re-run after a
//! rollback; it must not have side effects outside the transaction.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::Error;
use crate::retry::{Backoff, RetryPolicy};

/// A connection able to bracket work in a transaction.
#[async_trait]
pub trait TransactionConnection: Send {
    async fn begin(&mut self) -> Result<(), Error>;
    async fn commit(&mut self) -> Result<(), Error>;
    async fn rollback(&mut self) -> Result<(), Error>;
}

/// Source of exclusive connections, typically a pool.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    type Connection: TransactionConnection;

    async fn acquire(&self) -> Result<Self::Connection, Error>;
}

/// Exclusive handle to the connection running one transaction attempt.
///
/// Dereferences to the underlying connection.
pub struct TransactionContext<C> {
    conn: C,
    attempt: u32,
}

impl<C> TransactionContext<C> {
    /// Zero-based attempt number; non-zero only under [`TransactionStrategy::Retry`].
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl<C> Deref for TransactionContext<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for TransactionContext<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

/// What to do when the unit of work (or commit) fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStrategy {
    /// Roll back and return the error.
    #[default]
    RollbackAndThrow,
    /// Roll back and return `Ok(None)`.
    RollbackAndReturnNone,
    /// Roll back and re-run retryable failures with backoff, then behave
    /// like `RollbackAndThrow`.
    Retry,
}

#[derive(Debug, Clone)]
pub struct TransactionOptions {
    pub strategy: TransactionStrategy,
    /// Retry budget, delays and retryable-error classification under
    /// [`TransactionStrategy::Retry`]. Ignored by the other strategies.
    pub retry: RetryPolicy,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self { strategy: TransactionStrategy::default(), retry: RetryPolicy::new(3, Duration::from_millis(1000)) }
    }
}

impl TransactionOptions {
    pub fn strategy(strategy: TransactionStrategy) -> Self {
        Self { strategy, ..Self::default() }
    }

    /// Retry strategy with a fixed delay.
    pub fn retry(max_retries: u32, retry_delay: Duration) -> Self {
        Self::strategy(TransactionStrategy::Retry).with_policy(RetryPolicy::new(max_retries, retry_delay))
    }

    /// Use `policy` for retries, classifier included.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.retry = self.retry.with_backoff(backoff);
        self
    }

    /// Replace which failures the retry strategy re-runs.
    pub fn with_classifier(mut self, classifier: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.retry = self.retry.with_classifier(classifier);
        self
    }
}

/// Runs units of work against connections from `P`.
pub struct TransactionRunner<P> {
    provider: P,
}

impl<P: ConnectionProvider> TransactionRunner<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Execute `unit_of_work` inside a transaction.
    ///
    /// Returns `Ok(Some(value))` on commit, `Ok(None)` only under
    /// [`TransactionStrategy::RollbackAndReturnNone`].
    pub async fn run<T, F>(&self, options: &TransactionOptions, mut unit_of_work: F) -> Result<Option<T>, Error>
    where
        F: for<'c> FnMut(&'c mut TransactionContext<P::Connection>) -> BoxFuture<'c, Result<T, Error>>,
    {
        let policy = &options.retry;
        let mut attempt = 0;
        loop {
            let err = match self.attempt(&mut unit_of_work, attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(attempts = attempt + 1, "transaction committed after retry");
                    }
                    return Ok(Some(value));
                }
                Err(err) => err,
            };

            match options.strategy {
                TransactionStrategy::RollbackAndThrow => return Err(err),
                TransactionStrategy::RollbackAndReturnNone => {
                    tracing::debug!(kind = err.kind().code(), "transaction rolled back, returning none: {err}");
                    return Ok(None);
                }
                TransactionStrategy::Retry => {
                    attempt += 1;
                    if !policy.should_retry(attempt, &err) {
                        if attempt > policy.max_retries() {
                            tracing::warn!(attempts = attempt, "transaction retries exhausted: {err}");
                        }
                        return Err(err);
                    }
                    let delay = policy.delay_for(attempt);
                    tracing::warn!(attempt, kind = err.kind().code(), ?delay, "retrying transaction: {err}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt<T, F>(&self, unit_of_work: &mut F, attempt: u32) -> Result<T, Error>
    where
        F: for<'c> FnMut(&'c mut TransactionContext<P::Connection>) -> BoxFuture<'c, Result<T, Error>>,
    {
        let conn = self.provider.acquire().await?;
        let mut ctx = TransactionContext { conn, attempt };
        ctx.conn.begin().await?;

        let result = match unit_of_work(&mut ctx).await {
            Ok(value) => ctx.conn.commit().await.map(|()| value),
            Err(err) => Err(err),
        };

        if let Err(err) = &result {
            tracing::debug!(attempt, kind = err.kind().code(), "rolling back transaction");
            if let Err(rollback_err) = ctx.conn.rollback().await {
                tracing::warn!(attempt, "rollback failed: {rollback_err}");
            }
        }
        result
    }
}
