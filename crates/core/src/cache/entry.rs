//! Cached query state.

use serde::Serialize;
use tokio::time::Instant;

use crate::Error;

/// Lifecycle of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Idle,
    Loading,
    Success,
    Error,
}

/// State held for one cache key.
///
/// `status == Success` implies `data` is present and `error` absent.
/// `status == Error` implies `error` is present; `data` then only holds the
/// last successful value when previous data is kept.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub data: Option<T>,
    pub error: Option<Error>,
    pub status: Status,
    pub created_at: Instant,
    pub last_accessed: Instant,
    pub hit_count: u64,
    /// Set once the entry outlives its TTL; cleared only by a successful fetch.
    pub stale: bool,
}

impl<T> CacheEntry<T> {
    /// Fresh entry with no data yet.
    pub fn idle() -> Self {
        let now = Instant::now();
        Self {
            data: None,
            error: None,
            status: Status::Idle,
            created_at: now,
            last_accessed: now,
            hit_count: 0,
            stale: false,
        }
    }

    /// Entry holding freshly fetched data.
    pub fn success(data: T) -> Self {
        Self { data: Some(data), status: Status::Success, ..Self::idle() }
    }

    /// Entry holding a failure and no data.
    pub fn failure(error: Error) -> Self {
        Self { error: Some(error), status: Status::Error, ..Self::idle() }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == Status::Error
    }

    pub fn is_loading(&self) -> bool {
        self.status == Status::Loading
    }

    /// Age relative to `now`.
    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Record a successful fetch: data replaced, error cleared, new
    /// freshness cycle started. Access statistics are kept.
    pub(crate) fn settle_success(&mut self, data: T) {
        self.data = Some(data);
        self.error = None;
        self.status = Status::Success;
        self.created_at = Instant::now();
        self.stale = false;
    }

    /// Record a failed fetch, optionally keeping the last good data.
    pub(crate) fn settle_error(&mut self, error: Error, keep_previous_data: bool) {
        if !keep_previous_data {
            self.data = None;
        }
        self.error = Some(error);
        self.status = Status::Error;
    }

    /// Leave `Loading` after a fetch whose result was not committed, going
    /// back to whatever the held data and error describe.
    pub(crate) fn settle_discarded(&mut self) {
        if self.status != Status::Loading {
            return;
        }
        self.status = match (&self.data, &self.error) {
            (_, Some(_)) => Status::Error,
            (Some(_), None) => Status::Success,
            (None, None) => Status::Idle,
        };
    }
}
