//! Per-key observer registry.
//!
//! Callbacks run synchronously on the notifying thread, outside the
//! registry lock. A panicking callback is caught and logged; the remaining
//! callbacks for the key still run and it stays registered.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cache::CacheKey;

/// Observer callback.
pub type Callback<E> = Arc<dyn Fn(&CacheKey, &E) + Send + Sync>;

type Registry<E> = Mutex<HashMap<CacheKey, Vec<(u64, Callback<E>)>>>;

/// Multimap of key → callbacks.
pub struct SubscriptionBus<E> {
    registry: Arc<Registry<E>>,
    next_id: AtomicU64,
}

impl<E> Default for SubscriptionBus<E> {
    fn default() -> Self {
        Self { registry: Arc::new(Mutex::new(HashMap::new())), next_id: AtomicU64::new(0) }
    }
}

/// Handle returned by [`SubscriptionBus::subscribe`].
///
/// Dropping the handle does not unsubscribe; call [`unsubscribe`](Self::unsubscribe).
pub struct Subscription<E> {
    registry: Weak<Registry<E>>,
    key: CacheKey,
    id: u64,
}

impl<E> Subscription<E> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Remove the callback. Returns whether it was still registered.
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut registry = registry.lock();
        let Some(callbacks) = registry.get_mut(&self.key) else {
            return false;
        };
        let before = callbacks.len();
        callbacks.retain(|(id, _)| *id != self.id);
        let removed = callbacks.len() < before;
        if callbacks.is_empty() {
            registry.remove(&self.key);
        }
        removed
    }
}

impl<E> SubscriptionBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for changes to `key`.
    pub fn subscribe(&self, key: CacheKey, callback: impl Fn(&CacheKey, &E) + Send + Sync + 'static) -> Subscription<E> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.lock().entry(key.clone()).or_default().push((id, Arc::new(callback)));
        Subscription { registry: Arc::downgrade(&self.registry), key, id }
    }

    /// Invoke every callback registered for `key`, in registration order.
    /// Returns the number of callbacks that completed without panicking.
    pub fn notify(&self, key: &CacheKey, event: &E) -> usize {
        let callbacks: Vec<Callback<E>> = match self.registry.lock().get(key) {
            Some(callbacks) => callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(key, event))) {
                Ok(()) => delivered += 1,
                Err(_) => tracing::warn!(key = %key, "subscriber panicked during notification"),
            }
        }
        delivered
    }

    /// Number of callbacks registered for `key`.
    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.registry.lock().get(key).map_or(0, Vec::len)
    }
}
