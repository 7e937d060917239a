//! Data source abstraction consumed by the query path.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::Error;

/// Loads the value for a resource given its request parameters.
///
/// Implementations classify their own failures (see [`ErrorKind`](crate::ErrorKind));
/// the engine retries only what the classification allows.
#[async_trait]
pub trait Fetcher<T>: Send + Sync {
    async fn fetch(&self, params: &Value) -> Result<T, Error>;
}

/// Adapter turning an async closure into a [`Fetcher`].
pub struct FnFetcher<F>(F);

#[async_trait]
impl<T, F, Fut> Fetcher<T> for FnFetcher<F>
where
    T: Send + 'static,
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, Error>> + Send,
{
    async fn fetch(&self, params: &Value) -> Result<T, Error> {
        (self.0)(params.clone()).await
    }
}

/// Wrap an async closure as a shareable fetcher.
pub fn fetcher_fn<T, F, Fut>(f: F) -> Arc<dyn Fetcher<T>>
where
    T: Send + 'static,
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, Error>> + Send + 'static,
{
    Arc::new(FnFetcher(f))
}
