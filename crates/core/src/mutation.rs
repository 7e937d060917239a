//! Optimistic writes with reconciliation.
//!
//! Mutations are never deduplicated. Each call takes a version number for
//! its key; only the most recent call for a key may reconcile the cache, so
//! a slow mutation finishing after a newer one cannot overwrite its result.
//! While calls for a key overlap, the entry they started from is kept; a
//! failing newest call restores that entry rather than another call's
//! unconfirmed optimistic value.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use crate::Error;
use crate::cache::{CacheEntry, CacheKey};
use crate::revalidation::QueryClient;

type SuccessCallback<T> = Box<dyn FnOnce(&T) + Send>;
type ErrorCallback = Box<dyn FnOnce(&Error) + Send>;
type SettledCallback<T> = Box<dyn FnOnce(Option<&T>, Option<&Error>) + Send>;

/// Options for one [`MutationCoordinator::mutate`] call.
pub struct MutationOptions<T> {
    /// Value shown to readers while the producer runs.
    pub optimistic_data: Option<T>,
    /// Invalidate the key after a successful mutation (default true).
    pub revalidate: bool,
    on_success: Option<SuccessCallback<T>>,
    on_error: Option<ErrorCallback>,
    on_settled: Option<SettledCallback<T>>,
}

impl<T> Default for MutationOptions<T> {
    fn default() -> Self {
        Self { optimistic_data: None, revalidate: true, on_success: None, on_error: None, on_settled: None }
    }
}

impl<T> MutationOptions<T> {
    pub fn optimistic(mut self, data: T) -> Self {
        self.optimistic_data = Some(data);
        self
    }

    pub fn revalidate(mut self, enabled: bool) -> Self {
        self.revalidate = enabled;
        self
    }

    pub fn on_success(mut self, f: impl FnOnce(&T) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&Error) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_settled(mut self, f: impl FnOnce(Option<&T>, Option<&Error>) + Send + 'static) -> Self {
        self.on_settled = Some(Box::new(f));
        self
    }
}

/// Mutations in progress for one key.
struct Pending<T> {
    /// Version of the newest call; only it may reconcile the cache.
    version: u64,
    /// Last confirmed entry, put back when the newest call fails.
    base: Option<CacheEntry<T>>,
    outstanding: usize,
}

/// A call whose producer is running. Dropped unsettled (the caller's
/// future was cancelled), it is reconciled as a failure without callbacks.
struct InFlight<'a, T: Clone + Send + Sync + 'static> {
    coordinator: &'a MutationCoordinator<T>,
    key: &'a CacheKey,
    version: u64,
    optimistic: bool,
    settled: bool,
}

impl<T: Clone + Send + Sync + 'static> InFlight<'_, T> {
    fn settle(&mut self, result: Option<&T>, revalidate: bool) {
        self.settled = true;
        self.coordinator.reconcile(self.key, self.version, self.optimistic, result, revalidate);
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for InFlight<'_, T> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(key = %self.key, version = self.version, "mutation dropped before settling");
            self.settle(None, false);
        }
    }
}

/// Runs mutations against a [`QueryClient`]'s cache.
pub struct MutationCoordinator<T> {
    client: QueryClient<T>,
    latest: Mutex<HashMap<CacheKey, Pending<T>>>,
    next_version: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> MutationCoordinator<T> {
    pub fn new(client: QueryClient<T>) -> Self {
        Self { client, latest: Mutex::new(HashMap::new()), next_version: AtomicU64::new(1) }
    }

    pub fn client(&self) -> &QueryClient<T> {
        &self.client
    }

    /// Run `producer` as a mutation of the entry for `(resource, params)`.
    pub async fn mutate<F, Fut>(
        &self, resource: &str, params: &Value, producer: F, options: MutationOptions<T>,
    ) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let key = CacheKey::new(resource, params);
        self.mutate_key(&key, producer, options).await
    }

    /// Like [`mutate`](Self::mutate) with a precomputed key.
    pub async fn mutate_key<F, Fut>(&self, key: &CacheKey, producer: F, options: MutationOptions<T>) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let MutationOptions { optimistic_data, revalidate, on_success, on_error, on_settled } = options;
        let optimistic = optimistic_data.is_some();

        let version = {
            let _writes = self.client.lock_writes();
            let version = self.begin(key);
            if let Some(data) = optimistic_data {
                tracing::debug!(key = %key, version, "applying optimistic data");
                self.client.commit(key, |entry| entry.settle_success(data));
            }
            version
        };

        let mut in_flight = InFlight { coordinator: self, key, version, optimistic, settled: false };
        let outcome = producer().await;
        in_flight.settle(outcome.as_ref().ok(), revalidate);

        match &outcome {
            Ok(data) => {
                if let Some(f) = on_success {
                    f(data);
                }
            }
            Err(err) => {
                tracing::warn!(key = %key, version, kind = err.kind().code(), "mutation failed: {err}");
                if let Some(f) = on_error {
                    f(err);
                }
            }
        }

        if let Some(f) = on_settled {
            f(outcome.as_ref().ok(), outcome.as_ref().err());
        }
        outcome
    }

    /// Reconcile the cache once call `version` is done; `result` is `None`
    /// when it failed or was cancelled.
    fn reconcile(&self, key: &CacheKey, version: u64, optimistic: bool, result: Option<&T>, revalidate: bool) {
        let _writes = self.client.lock_writes();
        let (current, base) = self.finish(key, version);
        match result {
            Some(data) if current => {
                self.client.set_data(key, data.clone());
                if revalidate {
                    self.client.invalidate(key);
                }
                self.rebase(key, self.client.peek(key));
            }
            Some(_) => tracing::debug!(key = %key, version, "mutation superseded, result not applied"),
            None if current && optimistic => self.client.restore(key, base),
            None => {}
        }
        self.client.release_writes(key);
    }

    /// Number of keys with a mutation in progress.
    pub fn pending(&self) -> usize {
        self.latest.lock().len()
    }

    /// Take the next version for `key`. The first of a run of overlapping
    /// calls records the entry they all fall back to.
    fn begin(&self, key: &CacheKey) -> u64 {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let mut latest = self.latest.lock();
        match latest.get_mut(key) {
            Some(pending) => {
                pending.version = version;
                pending.outstanding += 1;
            }
            None => {
                let base = self.client.peek(key);
                latest.insert(key.clone(), Pending { version, base, outstanding: 1 });
            }
        }
        self.client.hold_writes(key);
        version
    }

    /// Whether `version` is still the newest call for `key`, and the entry
    /// to restore if it failed.
    fn finish(&self, key: &CacheKey, version: u64) -> (bool, Option<CacheEntry<T>>) {
        let mut latest = self.latest.lock();
        let Some(pending) = latest.get_mut(key) else {
            return (false, None);
        };
        pending.outstanding = pending.outstanding.saturating_sub(1);
        let current = pending.version == version;
        let base = if current { pending.base.clone() } else { None };
        if pending.outstanding == 0 {
            latest.remove(key);
        }
        (current, base)
    }

    /// Record a confirmed write for calls on `key` still running.
    fn rebase(&self, key: &CacheKey, entry: Option<CacheEntry<T>>) {
        if let Some(pending) = self.latest.lock().get_mut(key) {
            pending.base = entry;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::cache::{CacheConfig, Status};
    use crate::fetcher::fetcher_fn;
    use crate::revalidation::QueryOptions;
    use crate::retry::RetryPolicy;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn coordinator() -> MutationCoordinator<String> {
        let config = CacheConfig { sweep: false, ..CacheConfig::default() };
        MutationCoordinator::new(QueryClient::new(config, RetryPolicy::never()))
    }

    fn page_key() -> CacheKey {
        CacheKey::new("page", &json!({"id": 42}))
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_mutation_restores_previous_data() {
        let mutations = coordinator();
        let key = page_key();
        mutations.client().set_data(&key, "original".into());

        let errors = Arc::new(AtomicUsize::new(0));
        let successes = Arc::new(AtomicUsize::new(0));
        let (errors_clone, successes_clone) = (Arc::clone(&errors), Arc::clone(&successes));
        let options = MutationOptions::default()
            .optimistic("X".to_string())
            .on_error(move |_| {
                errors_clone.fetch_add(1, Ordering::SeqCst);
            })
            .on_success(move |_| {
                successes_clone.fetch_add(1, Ordering::SeqCst);
            });

        let client = mutations.client().clone();
        let seen_during = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen_during);
        let result = mutations
            .mutate_key(
                &key,
                || async move {
                    *seen_clone.lock() = client.peek(&page_key()).and_then(|entry| entry.data);
                    Err::<String, _>(Error::Validation("title required".into()))
                },
                options,
            )
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(seen_during.lock().as_deref(), Some("X"));
        assert_eq!(mutations.client().peek(&key).unwrap().data.as_deref(), Some("original"));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(successes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_mutation_without_prior_entry_removes_optimistic_value() {
        let mutations = coordinator();
        let key = page_key();
        let notified = Arc::new(Mutex::new(Vec::new()));
        let notified_clone = Arc::clone(&notified);
        let _ = mutations.client().subscribe(key.clone(), move |_, entry: &CacheEntry<String>| {
            notified_clone.lock().push((entry.status, entry.data.clone()));
        });

        let result = mutations
            .mutate_key(
                &key,
                || async { Err::<String, _>(Error::Transient("down".into())) },
                MutationOptions::default().optimistic("X".to_string()),
            )
            .await;

        assert!(result.is_err());
        assert!(mutations.client().peek(&key).is_none());
        assert_eq!(*notified.lock(), vec![(Status::Success, Some("X".to_string())), (Status::Idle, None)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_mutation_notifies_then_invalidates() {
        let mutations = coordinator();
        let key = page_key();
        mutations.client().set_data(&key, "original".into());

        let notified = Arc::new(Mutex::new(Vec::new()));
        let notified_clone = Arc::clone(&notified);
        let _ = mutations.client().subscribe(key.clone(), move |_, entry: &CacheEntry<String>| {
            notified_clone.lock().push(entry.data.clone());
        });

        let settled = Arc::new(Mutex::new(None));
        let settled_clone = Arc::clone(&settled);
        let options = MutationOptions::default().optimistic("X".to_string()).on_settled(move |data, err| {
            *settled_clone.lock() = Some((data.cloned(), err.is_some()));
        });

        let result = mutations.mutate("page", &json!({"id": 42}), || async { Ok("saved".to_string()) }, options).await;

        assert_eq!(result.unwrap(), "saved");
        assert_eq!(*notified.lock(), vec![Some("X".to_string()), Some("saved".to_string())]);
        assert!(mutations.client().peek(&key).is_none());
        assert_eq!(*settled.lock(), Some((Some("saved".to_string()), false)));
        assert_eq!(mutations.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_revalidate_result_stays_cached() {
        let mutations = coordinator();
        let key = page_key();

        mutations
            .mutate_key(&key, || async { Ok("saved".to_string()) }, MutationOptions::default().revalidate(false))
            .await
            .unwrap();

        assert_eq!(mutations.client().peek(&key).unwrap().data.as_deref(), Some("saved"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_mutation_does_not_overwrite() {
        let mutations = Arc::new(coordinator());
        let key = page_key();
        let no_revalidate = || MutationOptions::default().revalidate(false);

        let slow = {
            let mutations = Arc::clone(&mutations);
            let key = key.clone();
            tokio::spawn(async move {
                mutations
                    .mutate_key(
                        &key,
                        || async {
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            Ok("first".to_string())
                        },
                        no_revalidate(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let fast = mutations
            .mutate_key(
                &key,
                || async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok("second".to_string())
                },
                no_revalidate(),
            )
            .await;

        assert_eq!(fast.unwrap(), "second");
        assert_eq!(slow.await.unwrap().unwrap(), "first");
        assert_eq!(mutations.client().peek(&key).unwrap().data.as_deref(), Some("second"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_mutations_each_run() {
        let mutations = coordinator();
        let key = page_key();
        let calls = Arc::new(AtomicUsize::new(0));

        let run = || {
            let calls = Arc::clone(&calls);
            mutations.mutate_key(
                &key,
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("v".to_string())
                },
                MutationOptions::default(),
            )
        };
        let (a, b) = tokio::join!(run(), run());

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_failed_mutations_restore_confirmed_data() {
        let mutations = Arc::new(coordinator());
        let key = page_key();
        mutations.client().set_data(&key, "orig".into());

        let first = {
            let mutations = Arc::clone(&mutations);
            let key = key.clone();
            tokio::spawn(async move {
                mutations
                    .mutate_key(
                        &key,
                        || async {
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            Err::<String, _>(Error::Transient("down".into()))
                        },
                        MutationOptions::default().optimistic("X1".to_string()),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mutations.client().peek(&key).unwrap().data.as_deref(), Some("X1"));

        let second = mutations
            .mutate_key(
                &key,
                || async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err::<String, _>(Error::Validation("title required".into()))
                },
                MutationOptions::default().optimistic("X2".to_string()),
            )
            .await;

        assert!(second.is_err());
        assert_eq!(mutations.client().peek(&key).unwrap().data.as_deref(), Some("orig"));
        assert_eq!(mutations.pending(), 1);

        assert!(first.await.unwrap().is_err());
        let entry = mutations.client().peek(&key).unwrap();
        assert_eq!(entry.data.as_deref(), Some("orig"));
        assert!(entry.is_success());
        assert_eq!(mutations.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_confirmed_overlap_restores_confirmed_result() {
        let mutations = Arc::new(coordinator());
        let key = page_key();
        mutations.client().set_data(&key, "orig".into());
        let no_revalidate = || MutationOptions::default().revalidate(false);

        let slow = {
            let mutations = Arc::clone(&mutations);
            let key = key.clone();
            tokio::spawn(async move {
                mutations
                    .mutate_key(
                        &key,
                        || async {
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            Ok("late".to_string())
                        },
                        no_revalidate(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        mutations.mutate_key(&key, || async { Ok("saved".to_string()) }, no_revalidate()).await.unwrap();
        let failed = mutations
            .mutate_key(
                &key,
                || async { Err::<String, _>(Error::Transient("down".into())) },
                no_revalidate().optimistic("X".to_string()),
            )
            .await;

        assert!(failed.is_err());
        assert_eq!(mutations.client().peek(&key).unwrap().data.as_deref(), Some("saved"));
        slow.await.unwrap().unwrap();
        assert_eq!(mutations.client().peek(&key).unwrap().data.as_deref(), Some("saved"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_wins_over_slower_background_fetch() {
        let mutations = coordinator();
        let client = mutations.client().clone();
        let key = page_key();
        client.set_data(&key, "orig".into());
        tokio::time::advance(client.config().ttl + Duration::from_secs(1)).await;

        let fetches = Arc::new(AtomicUsize::new(0));
        let fetches_clone = Arc::clone(&fetches);
        let fetcher = fetcher_fn(move |_params| {
            let fetches = Arc::clone(&fetches_clone);
            async move {
                fetches.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok("server-old".to_string())
            }
        });

        let stale = client.query("page", fetcher, json!({"id": 42}), QueryOptions::default()).await;
        assert_eq!(stale.data.as_deref(), Some("orig"));
        assert!(stale.stale);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(client.is_fetching(&key));

        mutations
            .mutate_key(
                &key,
                || async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok("saved".to_string())
                },
                MutationOptions::default().revalidate(false),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert!(!client.is_fetching(&key));
        let entry = client.peek(&key).unwrap();
        assert_eq!(entry.data.as_deref(), Some("saved"));
        assert!(entry.is_success());
        assert!(!entry.stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimistic_write_over_expired_entry_is_fresh() {
        let mutations = coordinator();
        let client = mutations.client().clone();
        let key = page_key();
        client.set_data(&key, "orig".into());
        tokio::time::advance(client.config().ttl + Duration::from_secs(1)).await;

        let fetches = Arc::new(AtomicUsize::new(0));
        let fetches_clone = Arc::clone(&fetches);
        let fetcher = fetcher_fn(move |_params| {
            let fetches = Arc::clone(&fetches_clone);
            async move {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok("server".to_string())
            }
        });

        let reader = client.clone();
        let result = mutations
            .mutate_key(
                &key,
                || async move {
                    let seen = reader.query("page", fetcher, json!({"id": 42}), QueryOptions::default()).await;
                    assert_eq!(seen.data.as_deref(), Some("X"));
                    assert!(!seen.stale);
                    Ok("saved".to_string())
                },
                MutationOptions::default().optimistic("X".to_string()).revalidate(false),
            )
            .await;

        assert_eq!(result.unwrap(), "saved");
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_mutation_restores_and_unblocks_fetches() {
        let mutations = coordinator();
        let client = mutations.client().clone();
        let key = page_key();
        client.set_data(&key, "orig".into());

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            mutations.mutate_key(
                &key,
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok("never".to_string())
                },
                MutationOptions::default().optimistic("X".to_string()),
            ),
        )
        .await;

        assert!(cancelled.is_err());
        assert_eq!(mutations.pending(), 0);
        assert_eq!(client.peek(&key).unwrap().data.as_deref(), Some("orig"));

        let fetcher = fetcher_fn(|_params| async { Ok("server".to_string()) });
        let entry = client.query("page", fetcher, json!({"id": 42}), QueryOptions::default().force_refresh()).await;
        assert_eq!(entry.data.as_deref(), Some("server"));
        assert_eq!(client.peek(&key).unwrap().data.as_deref(), Some("server"));
    }
}
