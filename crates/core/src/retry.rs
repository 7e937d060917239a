//! Retry and backoff decisions shared by fetches and transactions.
//!
//! A policy answers two questions: may a failed operation be attempted
//! again (`should_retry`), and how long to wait first (`delay_for`).
//! Which errors are retryable is decided by an injected classifier; the
//! default trusts [`ErrorKind::is_retryable`](crate::ErrorKind::is_retryable).

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::Error;

/// Decides whether an error may be retried.
pub type Classifier = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed,
    /// Delay doubles with each retry, capped at `max_delay`.
    Exponential { max_delay: Duration },
}

/// Bounded retry policy.
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    backoff: Backoff,
    classifier: Classifier,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1000)).with_backoff(Backoff::Exponential { max_delay: Duration::from_secs(30) })
    }
}

impl RetryPolicy {
    /// Fixed-delay policy allowing `max_retries` retries after the first attempt.
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff: Backoff::Fixed,
            classifier: Arc::new(|err: &Error| err.is_retryable()),
        }
    }

    /// Policy that never retries.
    pub fn never() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Replace the backoff shape.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replace the retryable-error classifier.
    pub fn with_classifier(mut self, classifier: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether to retry after `attempt` failed attempts ended in `error`.
    ///
    /// `attempt` is 1 after the first failure.
    pub fn should_retry(&self, attempt: u32, error: &Error) -> bool {
        attempt <= self.max_retries && (self.classifier)(error)
    }

    /// Delay to wait before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential { max_delay } => {
                let exponent = attempt.saturating_sub(1).min(31);
                self.base_delay.saturating_mul(1u32 << exponent).min(max_delay)
            }
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. The last error is returned on failure.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if !self.should_retry(attempt, &err) {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    tracing::warn!(label, attempt, kind = err.kind().code(), ?delay, "retrying after error: {err}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_should_retry_respects_budget() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10));
        let err = Error::Transient("connection reset".into());
        assert!(policy.should_retry(1, &err));
        assert!(policy.should_retry(2, &err));
        assert!(!policy.should_retry(3, &err));
    }

    #[test]
    fn test_should_retry_respects_classification() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10));
        assert!(!policy.should_retry(1, &Error::Validation("bad slug".into())));
        assert!(policy.should_retry(1, &Error::Timeout("slow".into())));
    }

    #[test]
    fn test_custom_classifier() {
        let policy =
            RetryPolicy::new(5, Duration::from_millis(10)).with_classifier(|err| err.kind() == ErrorKind::NotFound);
        assert!(policy.should_retry(1, &Error::NotFound("page".into())));
        assert!(!policy.should_retry(1, &Error::Transient("reset".into())));
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::new(3, Duration::from_millis(250));
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(3), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100))
            .with_backoff(Backoff::Exponential { max_delay: Duration::from_millis(1000) });
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(64), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_transient_then_succeeds() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let calls = AtomicU32::new(0);

        let result = policy
            .run("test", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err(Error::Transient("flaky".into())) } else { Ok(n) }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_fatal_error() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let calls = AtomicU32::new(0);

        let result: Result<(), Error> = policy
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Validation("title required".into()))
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exhausts_budget() {
        let policy = RetryPolicy::new(2, Duration::from_millis(100));
        let calls = AtomicU32::new(0);

        let result: Result<(), Error> = policy
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Transient("down".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
