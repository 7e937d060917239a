//! Stale-while-revalidate reads over the cache store.
//!
//! [`QueryClient`] decides per read whether an entry is fresh, stale or
//! missing and either answers from memory, answers from memory while a
//! background refresh runs, or waits on a deduplicated fetch. Fetch results
//! are committed to the store and broadcast to subscribers from inside the
//! single producer run, so every settled fetch produces exactly one write and
//! one notification regardless of how many callers joined it.
//!
//! A fetch that was started before a mutation of its key began, or that
//! finishes while one is still running, is not committed: the mutation owns
//! the entry until it settles.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::Error;
use crate::cache::{CacheConfig, CacheEntry, CacheKey, CacheStats, CacheStore, InFlightResult, RequestDeduplicator, Status};
use crate::fetcher::Fetcher;
use crate::retry::RetryPolicy;
use crate::subscription::{Subscription, SubscriptionBus};

/// Per-call overrides of the client's [`CacheConfig`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub ttl: Option<Duration>,
    pub stale_while_revalidate: Option<bool>,
    pub keep_previous_data: Option<bool>,
    pub timeout: Option<Duration>,
    /// Skip the freshness check and always wait on a fetch.
    pub force_refresh: bool,
}

impl QueryOptions {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.stale_while_revalidate = Some(enabled);
        self
    }

    pub fn keep_previous_data(mut self, enabled: bool) -> Self {
        self.keep_previous_data = Some(enabled);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }
}

/// Settings for one fetch, resolved from config and per-call options.
#[derive(Debug, Clone, Copy)]
struct FetchSettings {
    timeout: Option<Duration>,
    keep_previous_data: bool,
}

/// Mutation activity on one key.
#[derive(Debug, Default)]
struct WriteFence {
    pending: usize,
    /// Ticket taken when a mutation last began or settled.
    touched: u64,
}

struct Inner<T> {
    store: Arc<CacheStore<T>>,
    dedup: RequestDeduplicator<CacheEntry<T>>,
    bus: SubscriptionBus<CacheEntry<T>>,
    retry: RetryPolicy,
    config: CacheConfig,
    /// Serializes commit+notify so a key's notifications follow write order.
    /// Reentrant so subscribers may write back from their callback.
    write_lock: ReentrantMutex<()>,
    fences: Mutex<HashMap<CacheKey, WriteFence>>,
    tickets: AtomicU64,
    sweeper: Option<JoinHandle<()>>,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// Cache-aware query entry point.
///
/// Cheap to clone; clones share the store, in-flight table and subscribers.
pub struct QueryClient<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for QueryClient<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Clone + Send + Sync + 'static> QueryClient<T> {
    /// Client over a new store sized from `config`.
    pub fn new(config: CacheConfig, retry: RetryPolicy) -> Self {
        let store = Arc::new(CacheStore::new(config.max_entries));
        Self::with_store(store, config, retry)
    }

    /// Client over an existing store.
    ///
    /// Starts the expiry sweeper when `config.sweep` is set and a tokio
    /// runtime is available.
    pub fn with_store(store: Arc<CacheStore<T>>, config: CacheConfig, retry: RetryPolicy) -> Self {
        let sweeper = if config.sweep && tokio::runtime::Handle::try_current().is_ok() {
            Some(store.spawn_sweeper(config.ttl))
        } else {
            None
        };
        let inner = Inner {
            store,
            dedup: RequestDeduplicator::new(),
            bus: SubscriptionBus::new(),
            retry,
            config,
            write_lock: ReentrantMutex::new(()),
            fences: Mutex::new(HashMap::new()),
            tickets: AtomicU64::new(0),
            sweeper,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Read `(resource, params)` through the cache.
    ///
    /// Never fails: fetch errors are reported on the returned entry.
    pub async fn query(
        &self, resource: &str, fetcher: Arc<dyn Fetcher<T>>, params: Value, options: QueryOptions,
    ) -> CacheEntry<T> {
        let key = CacheKey::new(resource, &params);
        self.query_key(key, fetcher, params, options).await
    }

    /// Like [`query`](Self::query) with a precomputed key.
    pub async fn query_key(
        &self, key: CacheKey, fetcher: Arc<dyn Fetcher<T>>, params: Value, options: QueryOptions,
    ) -> CacheEntry<T> {
        let config = &self.inner.config;
        let ttl = options.ttl.unwrap_or(config.ttl);
        let swr = options.stale_while_revalidate.unwrap_or(config.stale_while_revalidate);
        let settings = FetchSettings {
            timeout: options.timeout.or(config.fetch_timeout),
            keep_previous_data: options.keep_previous_data.unwrap_or(config.keep_previous_data),
        };

        if options.force_refresh {
            tracing::debug!(key = %key, "forced refresh");
            return self.fetch_blocking(key, fetcher, params, settings).await;
        }

        let Some(mut entry) = self.inner.store.get(&key) else {
            tracing::debug!(key = %key, "cache miss");
            return self.fetch_blocking(key, fetcher, params, settings).await;
        };

        let expired = CacheStore::is_stale(&entry, ttl);
        if !expired && entry.data.is_some() && !entry.is_error() {
            tracing::debug!(key = %key, hits = entry.hit_count, "cache hit");
            return entry;
        }

        if expired && !entry.stale {
            entry = self.inner.store.update(&key, |stored| {
                stored.stale = true;
                stored.clone()
            })
            .unwrap_or(entry);
        }

        if swr && entry.data.is_some() {
            tracing::debug!(key = %key, status = ?entry.status, "serving stale entry, revalidating");
            drop(self.revalidate(key, fetcher, params, settings));
            return entry;
        }

        self.fetch_blocking(key, fetcher, params, settings).await
    }

    /// Write `data` as a successful entry for `key` and notify subscribers.
    pub fn set_data(&self, key: &CacheKey, data: T) -> CacheEntry<T> {
        self.commit(key, |entry| entry.settle_success(data))
    }

    /// Current entry for `key` without recording an access.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        self.inner.store.peek(key)
    }

    pub fn subscribe(
        &self, key: CacheKey, callback: impl Fn(&CacheKey, &CacheEntry<T>) + Send + Sync + 'static,
    ) -> Subscription<CacheEntry<T>> {
        self.inner.bus.subscribe(key, callback)
    }

    /// Drop the entry for `key`; the next read fetches.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self.inner.store.invalidate(key);
        if removed {
            tracing::debug!(key = %key, "invalidated");
        }
        removed
    }

    /// Drop every entry derived from `resource`.
    pub fn invalidate_resource(&self, resource: &str) -> usize {
        let removed = self.inner.store.invalidate_resource(resource);
        tracing::debug!(resource, removed, "invalidated resource");
        removed
    }

    pub fn clear(&self) {
        self.inner.store.clear();
        tracing::debug!("cache cleared");
    }

    pub fn store(&self) -> &Arc<CacheStore<T>> {
        &self.inner.store
    }

    pub fn stats(&self) -> &CacheStats {
        self.inner.store.stats()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Whether a fetch for `key` is running.
    pub fn is_fetching(&self, key: &CacheKey) -> bool {
        self.inner.dedup.is_in_flight(key)
    }

    /// Apply `f` to the entry for `key` (creating it if evicted) and notify
    /// subscribers with the result.
    pub(crate) fn commit(&self, key: &CacheKey, f: impl FnOnce(&mut CacheEntry<T>)) -> CacheEntry<T> {
        let _guard = self.inner.write_lock.lock();
        let ((), entry) = self.inner.store.upsert(key, CacheEntry::idle, f);
        self.inner.bus.notify(key, &entry);
        entry
    }

    /// Hold the write lock so several writes reach subscribers as one
    /// uninterrupted sequence.
    pub(crate) fn lock_writes(&self) -> ReentrantMutexGuard<'_, ()> {
        self.inner.write_lock.lock()
    }

    /// Mark a mutation of `key` as running. Fetches for the key that settle
    /// before the matching [`release_writes`](Self::release_writes), or that
    /// started before this call, are not committed.
    pub(crate) fn hold_writes(&self, key: &CacheKey) {
        let ticket = self.ticket();
        let mut fences = self.inner.fences.lock();
        let fence = fences.entry(key.clone()).or_default();
        fence.pending += 1;
        fence.touched = ticket;
    }

    pub(crate) fn release_writes(&self, key: &CacheKey) {
        let ticket = self.ticket();
        let mut fences = self.inner.fences.lock();
        let Some(fence) = fences.get_mut(key) else {
            return;
        };
        fence.pending = fence.pending.saturating_sub(1);
        fence.touched = ticket;
        // A fetch already running still needs the fence to see this write.
        if fence.pending == 0 && !self.inner.dedup.is_in_flight(key) {
            fences.remove(key);
        }
    }

    fn ticket(&self) -> u64 {
        self.inner.tickets.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Whether a fetch that took `ticket` at start overlaps a mutation.
    fn fenced(&self, key: &CacheKey, ticket: u64) -> bool {
        let mut fences = self.inner.fences.lock();
        let Some(fence) = fences.get(key) else {
            return false;
        };
        let fenced = fence.pending > 0 || fence.touched > ticket;
        if fence.pending == 0 {
            fences.remove(key);
        }
        fenced
    }

    /// Put back `previous` and notify. With no previous entry the key is
    /// removed and subscribers receive an idle entry, so anyone shown the
    /// discarded value learns it is gone.
    pub(crate) fn restore(&self, key: &CacheKey, previous: Option<CacheEntry<T>>) {
        let _guard = self.inner.write_lock.lock();
        match previous {
            Some(entry) => {
                self.inner.store.set(key.clone(), entry.clone());
                self.inner.bus.notify(key, &entry);
            }
            None => {
                self.inner.store.invalidate(key);
                self.inner.bus.notify(key, &CacheEntry::idle());
            }
        }
    }

    async fn fetch_blocking(
        &self, key: CacheKey, fetcher: Arc<dyn Fetcher<T>>, params: Value, settings: FetchSettings,
    ) -> CacheEntry<T> {
        match self.revalidate(key, fetcher, params, settings).await {
            Ok(entry) => entry,
            Err(err) => CacheEntry::failure(err),
        }
    }

    /// Start (or join) the fetch for `key`. The fetch runs to completion
    /// even if the returned handle is dropped.
    fn revalidate(
        &self, key: CacheKey, fetcher: Arc<dyn Fetcher<T>>, params: Value, settings: FetchSettings,
    ) -> InFlightResult<CacheEntry<T>> {
        let client = self.clone();
        let task_key = key.clone();
        self.inner.dedup.run_once(&key, move || async move {
            Ok(client.fetch_and_commit(task_key, fetcher, params, settings).await)
        })
    }

    async fn fetch_and_commit(
        &self, key: CacheKey, fetcher: Arc<dyn Fetcher<T>>, params: Value, settings: FetchSettings,
    ) -> CacheEntry<T> {
        let ticket = self.ticket();
        self.inner.store.upsert(&key, CacheEntry::idle, |entry| entry.status = Status::Loading);

        let fetch = self.inner.retry.run(key.as_str(), || fetcher.fetch(&params));
        let outcome = match settings.timeout {
            Some(limit) => match tokio::time::timeout(limit, fetch).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::Timeout(format!("fetch for {key} exceeded {limit:?}"))),
            },
            None => fetch.await,
        };

        let _guard = self.inner.write_lock.lock();
        if self.fenced(&key, ticket) {
            tracing::debug!(key = %key, "fetch overlapped a mutation, result not committed");
            let current = self.inner.store.update(&key, |entry| {
                entry.settle_discarded();
                entry.clone()
            });
            return current.unwrap_or_else(|| match outcome {
                Ok(data) => CacheEntry::success(data),
                Err(err) => CacheEntry::failure(err),
            });
        }

        match outcome {
            Ok(data) => {
                tracing::debug!(key = %key, "fetch succeeded");
                self.commit(&key, |entry| entry.settle_success(data))
            }
            Err(err) => {
                tracing::warn!(key = %key, kind = err.kind().code(), "fetch failed: {err}");
                self.commit(&key, |entry| entry.settle_error(err, settings.keep_previous_data))
            }
        }
    }
}
