//! Database handle and SQL-backed fetcher.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tokio_rusqlite::Connection;

use crate::Error;
use crate::fetcher::Fetcher;

const PRAGMAS: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     PRAGMA temp_store=MEMORY;
     PRAGMA foreign_keys=ON;
     PRAGMA busy_timeout=5000;";

/// SQLite database handle.
///
/// Wraps a tokio-rusqlite Connection that runs statements on a background
/// thread. Clones share the connection.
#[derive(Clone, Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database at `path` with WAL and foreign keys on.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let conn = Connection::open(path).await?;
        Self::configure(conn).await
    }

    /// Open a private in-memory database with the same pragmas.
    pub async fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory().await?;
        Self::configure(conn).await
    }

    async fn configure(conn: Connection) -> Result<Self, Error> {
        conn.call(|conn| conn.execute_batch(PRAGMAS)).await?;
        Ok(Self { conn })
    }

    /// Run a statement, returning the number of changed rows.
    pub async fn execute(&self, sql: impl Into<String>, params: Value) -> Result<usize, Error> {
        let sql = sql.into();
        let changed = self.conn.call(move |conn| super::execute(conn, &sql, &params)).await?;
        Ok(changed)
    }

    /// Run several `;`-separated statements without parameters.
    pub async fn execute_batch(&self, sql: impl Into<String>) -> Result<(), Error> {
        let sql = sql.into();
        self.conn.call(move |conn| conn.execute_batch(&sql)).await?;
        Ok(())
    }

    /// Run a query, returning every row as a JSON object.
    pub async fn query(&self, sql: impl Into<String>, params: Value) -> Result<Vec<Value>, Error> {
        let sql = sql.into();
        let rows = self.conn.call(move |conn| super::query_rows(conn, &sql, &params)).await?;
        Ok(rows)
    }

    /// Run a query expected to return one row.
    pub async fn query_one(&self, sql: impl Into<String>, params: Value) -> Result<Value, Error> {
        let sql = sql.into();
        let rows = self.query(sql.clone(), params).await?;
        rows.into_iter().next().ok_or_else(|| Error::NotFound(format!("no row for `{sql}`")))
    }
}

/// Fetcher running a fixed SQL query with the request params bound.
///
/// Yields a JSON array of rows, or a single row object (`NotFound` when
/// empty) for fetchers built with [`SqlFetcher::single`].
#[derive(Debug, Clone)]
pub struct SqlFetcher {
    db: Database,
    sql: String,
    single: bool,
}

impl SqlFetcher {
    pub fn new(db: Database, sql: impl Into<String>) -> Self {
        Self { db, sql: sql.into(), single: false }
    }

    pub fn single(db: Database, sql: impl Into<String>) -> Self {
        Self { db, sql: sql.into(), single: true }
    }
}

#[async_trait]
impl Fetcher<Value> for SqlFetcher {
    async fn fetch(&self, params: &Value) -> Result<Value, Error> {
        if self.single {
            self.db.query_one(self.sql.as_str(), params.clone()).await
        } else {
            self.db.query(self.sql.as_str(), params.clone()).await.map(Value::Array)
        }
    }
}
