//! Single entry point bundling queries, mutations and transactions.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::Error;
use crate::cache::{CacheEntry, CacheKey, CacheStore};
use crate::config::EngineConfig;
use crate::fetcher::Fetcher;
use crate::mutation::{MutationCoordinator, MutationOptions};
use crate::revalidation::{QueryClient, QueryOptions};
use crate::subscription::Subscription;
use crate::transaction::{ConnectionProvider, TransactionContext, TransactionOptions, TransactionRunner};

/// Caching engine over values of type `T`, with transactions run against
/// connections from `P`.
pub struct Engine<T, P> {
    mutations: MutationCoordinator<T>,
    transactions: TransactionRunner<P>,
}

impl<T: Clone + Send + Sync + 'static, P: ConnectionProvider> Engine<T, P> {
    /// Engine with a new store configured from `config`.
    pub fn new(config: &EngineConfig, provider: P) -> Self {
        Self::from_parts(QueryClient::new(config.cache(), config.retry.policy()), provider)
    }

    /// Engine over an existing store, e.g. one shared with another engine.
    pub fn with_store(store: Arc<CacheStore<T>>, config: &EngineConfig, provider: P) -> Self {
        Self::from_parts(QueryClient::with_store(store, config.cache(), config.retry.policy()), provider)
    }

    pub fn from_parts(queries: QueryClient<T>, provider: P) -> Self {
        Self { mutations: MutationCoordinator::new(queries), transactions: TransactionRunner::new(provider) }
    }

    pub async fn query(
        &self, resource: &str, fetcher: Arc<dyn Fetcher<T>>, params: Value, options: QueryOptions,
    ) -> CacheEntry<T> {
        self.queries().query(resource, fetcher, params, options).await
    }

    pub async fn mutate<F, Fut>(
        &self, resource: &str, params: &Value, producer: F, options: MutationOptions<T>,
    ) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        self.mutations.mutate(resource, params, producer, options).await
    }

    pub fn subscribe(
        &self, key: CacheKey, callback: impl Fn(&CacheKey, &CacheEntry<T>) + Send + Sync + 'static,
    ) -> Subscription<CacheEntry<T>> {
        self.queries().subscribe(key, callback)
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.queries().invalidate(key)
    }

    pub fn clear(&self) {
        self.queries().clear();
    }

    pub async fn transaction<R, F>(&self, options: &TransactionOptions, unit_of_work: F) -> Result<Option<R>, Error>
    where
        F: for<'c> FnMut(&'c mut TransactionContext<P::Connection>) -> BoxFuture<'c, Result<R, Error>>,
    {
        self.transactions.run(options, unit_of_work).await
    }

    pub fn queries(&self) -> &QueryClient<T> {
        self.mutations.client()
    }

    pub fn mutations(&self) -> &MutationCoordinator<T> {
        &self.mutations
    }

    pub fn transactions(&self) -> &TransactionRunner<P> {
        &self.transactions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{Database, SqlFetcher, SqlitePool};
    use serde_json::json;

    async fn engine() -> (Engine<Value, SqlitePool>, Database) {
        let db = Database::open_in_memory().await.unwrap();
        db.execute_batch(
            "CREATE TABLE pages (id INTEGER PRIMARY KEY, title TEXT NOT NULL);
             INSERT INTO pages (id, title) VALUES (42, 'Draft');",
        )
        .await
        .unwrap();
        let config = EngineConfig { sweep_enabled: false, ..EngineConfig::default() };
        let engine = Engine::new(&config, SqlitePool::from_databases([db.clone()]));
        (engine, db)
    }

    #[tokio::test]
    async fn test_query_transaction_invalidate_cycle() {
        let (engine, db) = engine().await;
        let fetcher: Arc<dyn Fetcher<Value>> = Arc::new(SqlFetcher::single(db, "SELECT title FROM pages WHERE id = :id"));
        let params = json!({"id": 42});

        let entry = engine.query("page", Arc::clone(&fetcher), params.clone(), QueryOptions::default()).await;
        assert_eq!(entry.data, Some(json!({"title": "Draft"})));

        let updated = engine
            .transaction(&TransactionOptions::default(), |tx| {
                Box::pin(async move { tx.execute("UPDATE pages SET title = 'Published' WHERE id = :id", json!({"id": 42})).await })
            })
            .await
            .unwrap();
        assert_eq!(updated, Some(1));

        let cached = engine.query("page", Arc::clone(&fetcher), params.clone(), QueryOptions::default()).await;
        assert_eq!(cached.data, Some(json!({"title": "Draft"})));

        assert!(engine.invalidate(&CacheKey::new("page", &params)));
        let fresh = engine.query("page", fetcher, params, QueryOptions::default()).await;
        assert_eq!(fresh.data, Some(json!({"title": "Published"})));
    }

    #[tokio::test]
    async fn test_mutation_visible_to_subscribers() {
        let (engine, _db) = engine().await;
        let params = json!({"id": 42});
        let key = CacheKey::new("page", &params);

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _ = engine.subscribe(key, move |_, entry: &CacheEntry<Value>| seen_clone.lock().push(entry.data.clone()));

        let saved = engine
            .mutate(
                "page",
                &params,
                || async { Ok(json!({"title": "Saved"})) },
                MutationOptions::default().optimistic(json!({"title": "Saving"})),
            )
            .await
            .unwrap();

        assert_eq!(saved, json!({"title": "Saved"}));
        assert_eq!(*seen.lock(), vec![Some(json!({"title": "Saving"})), Some(json!({"title": "Saved"}))]);
    }
}
