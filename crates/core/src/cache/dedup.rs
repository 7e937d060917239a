//! One in-flight fetch per key.
//!
//! The first caller for a key spawns the producer and registers a shared
//! handle to its result; callers arriving before it settles join that
//! handle. The registration is dropped inside the spawned task, after the
//! result is computed and before it is published, so no caller can observe
//! a settled fetch as still pending and no two producers overlap for a key.
//! A producer that panics drops its registration while unwinding and its
//! joiners resolve with [`Error::Unknown`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::key::CacheKey;
use crate::Error;

/// Shared handle to an in-flight result. Every clone resolves to the same value.
pub type InFlightResult<V> = Shared<BoxFuture<'static, Result<V, Error>>>;

type Table<V> = Mutex<HashMap<CacheKey, InFlight<V>>>;

struct InFlight<V> {
    id: u64,
    result: InFlightResult<V>,
}

/// Removes a key's registration when the owning task finishes (or panics).
struct Registration<V> {
    table: Weak<Table<V>>,
    key: CacheKey,
    id: u64,
}

impl<V> Drop for Registration<V> {
    fn drop(&mut self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut table = table.lock();
        if table.get(&self.key).is_some_and(|in_flight| in_flight.id == self.id) {
            table.remove(&self.key);
        }
    }
}

/// Collapses concurrent fetches of the same key into one producer run.
pub struct RequestDeduplicator<V> {
    table: Arc<Table<V>>,
    next_id: AtomicU64,
}

impl<V> Default for RequestDeduplicator<V> {
    fn default() -> Self {
        Self { table: Arc::new(Mutex::new(HashMap::new())), next_id: AtomicU64::new(0) }
    }
}

impl<V: Clone + Send + Sync + 'static> RequestDeduplicator<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `producer` for `key` unless a run is already in flight, in which
    /// case the existing run's result is returned.
    ///
    /// Registration happens when this is called, not when the returned
    /// future is first polled. Must be called within a tokio runtime.
    pub fn run_once<F, Fut>(&self, key: &CacheKey, producer: F) -> InFlightResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, Error>> + Send + 'static,
    {
        self.run_once_with_timeout(key, None, producer)
    }

    /// Like [`run_once`](Self::run_once), resolving every joiner with
    /// [`Error::Timeout`] if the producer does not settle within `timeout`.
    pub fn run_once_with_timeout<F, Fut>(
        &self, key: &CacheKey, timeout: Option<Duration>, producer: F,
    ) -> InFlightResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, Error>> + Send + 'static,
    {
        let mut table = self.table.lock();
        if let Some(in_flight) = table.get(key) {
            tracing::trace!(key = %key, "joined in-flight fetch");
            return in_flight.result.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let result = async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::Unknown("fetch task ended without a result".into())),
            }
        }
        .boxed()
        .shared();
        table.insert(key.clone(), InFlight { id, result: result.clone() });
        drop(table);

        let registration = Registration { table: Arc::downgrade(&self.table), key: key.clone(), id };
        let work = producer();
        let task_key = key.clone();

        tokio::spawn(async move {
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        tracing::debug!(key = %task_key, ?limit, "fetch timed out");
                        Err(Error::Timeout(format!("fetch for {task_key} exceeded {limit:?}")))
                    }
                },
                None => work.await,
            };
            drop(registration);
            let _ = tx.send(outcome);
        });

        result
    }

    /// Whether a fetch for `key` is currently registered.
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.table.lock().contains_key(key)
    }

    /// Number of keys with a registered fetch.
    pub fn in_flight(&self) -> usize {
        self.table.lock().len()
    }
}
