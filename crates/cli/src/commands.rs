//! Subcommand implementations.

use std::sync::Arc;

use anyhow::{Context, Result};
use quire_client::{HttpClient, HttpFetcher};
use quire_core::sql::{Database, SqlFetcher, SqlitePool};
use quire_core::{
    CacheEntry, CacheStats, Engine, EngineConfig, Fetcher, QueryClient, QueryOptions, TransactionOptions,
    TransactionStrategy,
};
use serde_json::{Value, json};

pub fn parse_params(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("invalid JSON params: {raw}"))
}

/// Cached SQL read; the statement text is the resource name.
pub async fn sql(config: &EngineConfig, sql: &str, params: Value, repeat: u32) -> Result<Value> {
    let db = Database::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;
    let pool = SqlitePool::open(&config.db_path, config.db_pool_size).await?;
    let engine = Engine::new(config, pool);

    let fetcher: Arc<dyn Fetcher<Value>> = Arc::new(SqlFetcher::new(db, sql));
    let entry = read(engine.queries(), sql, fetcher, params, repeat).await;
    Ok(report(&entry, engine.queries().stats()))
}

/// Cached HTTP GET; the path is the resource name.
pub async fn get(config: &EngineConfig, path: &str, params: Value, repeat: u32) -> Result<Value> {
    let http = Arc::new(HttpClient::new(&config.http)?);
    let client = QueryClient::new(config.cache(), config.retry.policy());

    let fetcher: Arc<dyn Fetcher<Value>> = Arc::new(HttpFetcher::new(http, path));
    let entry = read(&client, path, fetcher, params, repeat).await;
    Ok(report(&entry, client.stats()))
}

/// Run one statement inside a transaction.
pub async fn exec(config: &EngineConfig, sql: &str, params: Value, strategy: TransactionStrategy) -> Result<Value> {
    let pool = SqlitePool::open(&config.db_path, config.db_pool_size).await?;
    let engine: Engine<Value, SqlitePool> = Engine::new(config, pool);
    let options = TransactionOptions { strategy, retry: config.retry.policy() };

    let changed = engine
        .transaction(&options, |tx| {
            let (sql, params) = (sql.to_owned(), params.clone());
            Box::pin(async move { tx.execute(sql, params).await })
        })
        .await?;

    Ok(json!({ "committed": changed.is_some(), "changed": changed }))
}

async fn read(
    client: &QueryClient<Value>, resource: &str, fetcher: Arc<dyn Fetcher<Value>>, params: Value, repeat: u32,
) -> CacheEntry<Value> {
    let mut entry = client.query(resource, Arc::clone(&fetcher), params.clone(), QueryOptions::default()).await;
    for _ in 1..repeat {
        entry = client.query(resource, Arc::clone(&fetcher), params.clone(), QueryOptions::default()).await;
    }
    entry
}

pub fn report(entry: &CacheEntry<Value>, stats: &CacheStats) -> Value {
    json!({
        "status": entry.status,
        "stale": entry.stale,
        "hit_count": entry.hit_count,
        "data": entry.data,
        "error": entry.error.as_ref().map(|err| json!({ "kind": err.kind(), "message": err.to_string() })),
        "stats": {
            "hits": stats.hits(),
            "misses": stats.misses(),
            "inserts": stats.inserts(),
            "evictions": stats.evictions(),
            "expirations": stats.expirations(),
            "hit_ratio": stats.hit_ratio(),
        },
    })
}
