//! Named mutual-exclusion locks.
//!
//! A lock is held for the duration of one balance mutation:
//!
//! ```text
//! acquire(key) -> begin store transaction -> write + verify -> commit -> release
//! ```
//!
//! Two backends:
//! - `PgAdvisoryLock`: PostgreSQL session advisory locks, shared by every
//!   process connected to the same database
//! - `LocalLock`: per-key `tokio` mutexes, for a single process

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use sqlx::{Postgres, pool::PoolConnection};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{db::DbPool, error::LockError};

/// Lock key for one transaction's effect on one card.
///
/// Format: `card-ledger:{user_id}:{provider_transaction_id}:{card_id}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey(String);

impl LockKey {
    pub fn for_transaction(user_id: Uuid, provider_transaction_id: &str, card_id: Uuid) -> Self {
        Self(format!(
            "card-ledger:{user_id}:{provider_transaction_id}:{card_id}"
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Held lock. Call `release` when done; dropping also frees the lock.
#[async_trait]
pub trait LockGuard: Send {
    async fn release(self: Box<Self>);
}

/// Acquires named locks with at most one holder per key.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn acquire(&self, key: &LockKey) -> Result<Box<dyn LockGuard>, LockError>;
}

/// PostgreSQL advisory lock backend.
///
/// Each held lock pins one pooled connection, since advisory locks belong
/// to the session that took them.
pub struct PgAdvisoryLock {
    pool: DbPool,
    max_wait: Duration,
}

impl PgAdvisoryLock {
    const BASE_BACKOFF_MS: u64 = 10;
    const MAX_BACKOFF_MS: u64 = 250;

    pub fn new(pool: DbPool, max_wait: Duration) -> Self {
        Self { pool, max_wait }
    }
}

#[async_trait]
impl DistributedLock for PgAdvisoryLock {
    async fn acquire(&self, key: &LockKey) -> Result<Box<dyn LockGuard>, LockError> {
        let mut conn = self.pool.acquire().await?;
        let started = Instant::now();
        let mut backoff_ms = Self::BASE_BACKOFF_MS;

        loop {
            let acquired: bool =
                sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtextextended($1, 0))")
                    .bind(key.as_str())
                    .fetch_one(&mut *conn)
                    .await?;

            if acquired {
                tracing::debug!(key = %key, waited_ms = started.elapsed().as_millis() as u64, "Lock acquired");
                return Ok(Box::new(PgLockGuard {
                    key: key.clone(),
                    conn: Some(conn),
                }));
            }

            if started.elapsed() >= self.max_wait {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                });
            }

            let jitter = rand::random_range(0..=backoff_ms / 2);
            tokio::time::sleep(Duration::from_millis(backoff_ms + jitter)).await;
            backoff_ms = (backoff_ms * 2).min(Self::MAX_BACKOFF_MS);
        }
    }
}

struct PgLockGuard {
    key: LockKey,
    conn: Option<PoolConnection<Postgres>>,
}

#[async_trait]
impl LockGuard for PgLockGuard {
    async fn release(mut self: Box<Self>) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        let released = sqlx::query_scalar::<_, bool>(
            "SELECT pg_advisory_unlock(hashtextextended($1, 0))",
        )
        .bind(self.key.as_str())
        .fetch_one(&mut *conn)
        .await;

        match released {
            Ok(true) => tracing::debug!(key = %self.key, "Lock released"),
            Ok(false) => tracing::warn!(key = %self.key, "Advisory lock was not held at release"),
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Failed to release advisory lock, closing session");
                drop(conn.detach());
            }
        }
    }
}

impl Drop for PgLockGuard {
    fn drop(&mut self) {
        // Closing the session frees every advisory lock it holds.
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

/// In-process lock backend.
#[derive(Default)]
pub struct LocalLock {
    entries: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for LocalLock {
    async fn acquire(&self, key: &LockKey) -> Result<Box<dyn LockGuard>, LockError> {
        let entry = {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entries
                .entry(key.as_str().to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let guard = entry.lock_owned().await;
        Ok(Box::new(LocalLockGuard {
            key: key.as_str().to_string(),
            entries: self.entries.clone(),
            guard: Some(guard),
        }))
    }
}

struct LocalLockGuard {
    key: String,
    entries: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

#[async_trait]
impl LockGuard for LocalLockGuard {
    async fn release(self: Box<Self>) {
        drop(self);
    }
}

impl Drop for LocalLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Only the map still references the mutex: nobody holds or waits on it.
        if entries
            .get(&self.key)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            entries.remove(&self.key);
        }
    }
}
