//! Bounded in-memory key → entry table.
//!
//! Eviction picks the entry with the lowest hit count, breaking ties by the
//! oldest access. Entries older than the TTL are removed by a periodic sweep
//! whether or not they are read again.
//!
//! All operations are synchronous and never hold the table lock across an
//! await point.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::entry::CacheEntry;
use super::key::CacheKey;
use super::stats::CacheStats;

/// Bounded cache table.
#[derive(Debug)]
pub struct CacheStore<T> {
    entries: Mutex<HashMap<CacheKey, CacheEntry<T>>>,
    max_entries: usize,
    stats: CacheStats,
}

impl<T: Clone> CacheStore<T> {
    /// Create a store holding at most `max_entries` entries (minimum 1).
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self { entries: Mutex::new(HashMap::with_capacity(max_entries)), max_entries, stats: CacheStats::new() }
    }

    /// Look up an entry, recording the access.
    ///
    /// Bumps `hit_count` and `last_accessed` on the stored entry and returns
    /// a snapshot of it.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.hit_count += 1;
                entry.last_accessed = Instant::now();
                self.stats.record_hit();
                Some(entry.clone())
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// Look up an entry without touching its access statistics.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        self.entries.lock().get(key).cloned()
    }

    /// Insert or replace an entry, evicting first if a new key would
    /// exceed capacity.
    pub fn set(&self, key: CacheKey, entry: CacheEntry<T>) {
        let mut entries = self.entries.lock();
        self.make_room(&mut entries, &key);
        entries.insert(key, entry);
        self.stats.record_insert();
    }

    /// Apply `f` to an existing entry.
    pub fn update<R>(&self, key: &CacheKey, f: impl FnOnce(&mut CacheEntry<T>) -> R) -> Option<R> {
        self.entries.lock().get_mut(key).map(f)
    }

    /// Apply `f` to the entry for `key`, creating it with `init` first if
    /// absent. Returns `f`'s result and a snapshot of the entry.
    pub fn upsert<R>(
        &self, key: &CacheKey, init: impl FnOnce() -> CacheEntry<T>, f: impl FnOnce(&mut CacheEntry<T>) -> R,
    ) -> (R, CacheEntry<T>) {
        let mut entries = self.entries.lock();
        if !entries.contains_key(key) {
            self.make_room(&mut entries, key);
            self.stats.record_insert();
        }
        let entry = entries.entry(key.clone()).or_insert_with(init);
        let result = f(entry);
        (result, entry.clone())
    }

    /// Remove one entry. Returns whether it existed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Remove every entry derived from `resource`. Returns the count removed.
    pub fn invalidate_resource(&self, resource: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| key.resource() != resource);
        before - entries.len()
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Whether `entry` has outlived `ttl`. Pure: never mutates the entry.
    pub fn is_stale(entry: &CacheEntry<T>, ttl: Duration) -> bool {
        entry.age(Instant::now()) > ttl
    }

    /// Remove entries older than `ttl`. Returns the count removed.
    pub fn sweep_expired(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.age(now) <= ttl);
        let removed = before - entries.len();
        if removed > 0 {
            self.stats.record_expirations(removed as u64);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn make_room(&self, entries: &mut HashMap<CacheKey, CacheEntry<T>>, incoming: &CacheKey) {
        if entries.contains_key(incoming) {
            return;
        }
        while entries.len() >= self.max_entries {
            let Some(victim) = entries
                .iter()
                .min_by_key(|(_, entry)| (entry.hit_count, entry.last_accessed))
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            entries.remove(&victim);
            self.stats.record_eviction();
            tracing::debug!(key = %victim, "evicted cache entry");
        }
    }
}

impl<T: Clone + Send + 'static> CacheStore<T> {
    /// Spawn a task removing entries older than `ttl` every `ttl`.
    ///
    /// The task holds a weak reference and exits once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, ttl: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        let period = ttl.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let removed = store.sweep_expired(ttl);
                if removed > 0 {
                    tracing::info!(removed, remaining = store.len(), "swept expired cache entries");
                }
            }
        })
    }
}
