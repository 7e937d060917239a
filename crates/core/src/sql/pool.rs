//! Exclusive connections for transactions.
//!
//! A connection dropped with its transaction still open (the caller's
//! future was cancelled) is rolled back before anyone else can use it: a
//! task is spawned to roll it back, and `acquire` rolls back any slot it
//! finds still marked open.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::Database;
use crate::Error;
use crate::transaction::{ConnectionProvider, TransactionConnection};

struct Slot {
    db: Database,
    in_transaction: bool,
}

impl Slot {
    /// Roll back a transaction left open by a dropped connection.
    async fn recover(&mut self) {
        if !self.in_transaction {
            return;
        }
        tracing::warn!("rolling back transaction abandoned by a cancelled caller");
        if let Err(err) = self.db.execute_batch("ROLLBACK").await {
            tracing::warn!("rollback of abandoned transaction failed: {err}");
        }
        self.in_transaction = false;
    }
}

/// Fixed set of database connections handed out one caller at a time.
pub struct SqlitePool {
    slots: Vec<Arc<Mutex<Slot>>>,
    next: AtomicUsize,
}

impl SqlitePool {
    /// Open `size` connections (at least one) to the database at `path`.
    pub async fn open(path: impl AsRef<Path>, size: usize) -> Result<Self, Error> {
        let path = path.as_ref();
        let mut databases = Vec::with_capacity(size.max(1));
        for _ in 0..size.max(1) {
            databases.push(Database::open(path).await?);
        }
        tracing::debug!(path = %path.display(), size = databases.len(), "opened connection pool");
        Ok(Self::from_databases(databases))
    }

    /// Pool over already-open handles. An in-memory database must be
    /// pooled alone since each in-memory connection is a separate database.
    pub fn from_databases(databases: impl IntoIterator<Item = Database>) -> Self {
        let slots = databases.into_iter().map(|db| Arc::new(Mutex::new(Slot { db, in_transaction: false }))).collect();
        Self { slots, next: AtomicUsize::new(0) }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    async fn checkout(slot: &Arc<Mutex<Slot>>, mut guard: OwnedMutexGuard<Slot>) -> SqliteConnection {
        guard.recover().await;
        SqliteConnection { guard, slot: Arc::clone(slot) }
    }
}

#[async_trait]
impl ConnectionProvider for SqlitePool {
    type Connection = SqliteConnection;

    /// Take an idle connection, or wait for the next one round-robin.
    async fn acquire(&self) -> Result<SqliteConnection, Error> {
        for slot in &self.slots {
            if let Ok(guard) = Arc::clone(slot).try_lock_owned() {
                return Ok(Self::checkout(slot, guard).await);
            }
        }
        let slot = match self.slots.len() {
            0 => return Err(Error::Unknown("connection pool is empty".into())),
            len => &self.slots[self.next.fetch_add(1, Ordering::Relaxed) % len],
        };
        let guard = Arc::clone(slot).lock_owned().await;
        Ok(Self::checkout(slot, guard).await)
    }
}

/// Connection checked out of a [`SqlitePool`]; returned when dropped.
pub struct SqliteConnection {
    guard: OwnedMutexGuard<Slot>,
    slot: Arc<Mutex<Slot>>,
}

impl SqliteConnection {
    pub async fn execute(&self, sql: impl Into<String>, params: Value) -> Result<usize, Error> {
        self.guard.db.execute(sql, params).await
    }

    pub async fn query(&self, sql: impl Into<String>, params: Value) -> Result<Vec<Value>, Error> {
        self.guard.db.query(sql, params).await
    }

    pub async fn query_one(&self, sql: impl Into<String>, params: Value) -> Result<Value, Error> {
        self.guard.db.query_one(sql, params).await
    }

    /// Whether a transaction begun on this connection is still open.
    pub fn in_transaction(&self) -> bool {
        self.guard.in_transaction
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        if !self.guard.in_transaction {
            return;
        }
        // Runs once the guard is released; `acquire` covers the slot if
        // another caller takes it first or no runtime is available.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let slot = Arc::clone(&self.slot);
            drop(runtime.spawn(async move { slot.lock().await.recover().await }));
        }
    }
}

#[async_trait]
impl TransactionConnection for SqliteConnection {
    async fn begin(&mut self) -> Result<(), Error> {
        self.guard.db.execute_batch("BEGIN IMMEDIATE").await?;
        self.guard.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), Error> {
        self.guard.db.execute_batch("COMMIT").await?;
        self.guard.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), Error> {
        self.guard.db.execute_batch("ROLLBACK").await?;
        self.guard.in_transaction = false;
        Ok(())
    }
}
