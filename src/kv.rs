//! Key-value seam backing the idempotency store and rate limiter
//!
//! The pipeline needs exactly four primitives: atomic set-if-absent with TTL,
//! existence check, counter increment, and per-key expiry. `RedisKv` is the
//! production backend; `InMemoryKv` keeps unit tests hermetic.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("key-value backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for KvError {
    fn from(e: redis::RedisError) -> Self {
        Self::Backend(e.to_string())
    }
}

#[async_trait]
pub trait KeyValue: Send + Sync {
    /// Atomic set-if-absent with TTL. Returns whether this call created the
    /// key. A separate check-then-set is forbidden; concurrent callers for
    /// one key must see exactly one `true`.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    async fn exists(&self, key: &str) -> Result<bool, KvError>;

    /// Increment a counter key, creating it at 1.
    async fn incr(&self, key: &str) -> Result<i64, KvError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError>;

    /// Backend liveness, for health reporting.
    async fn ping(&self) -> Result<(), KvError>;
}

/// Redis backend. `ConnectionManager` multiplexes one connection and is safe
/// to clone per call.
#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KeyValue for RedisKv {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let n: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(n > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let mut conn = self.conn.clone();
        let n: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(n)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

struct InMemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl InMemoryEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Mutex-guarded map with lazy expiry. Test and development backend.
#[derive(Default)]
pub struct InMemoryKv {
    entries: Mutex<HashMap<String, InMemoryEntry>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, InMemoryEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl KeyValue for InMemoryKv {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut entries = self.lock();
        let live = entries.get(key).map(|e| !e.expired()).unwrap_or(false);
        if live {
            return Ok(false);
        }
        entries.insert(
            key.to_owned(),
            InMemoryEntry { value: value.to_owned(), expires_at: Some(Instant::now() + ttl) },
        );
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.lock().get(key).map(|e| !e.expired()).unwrap_or(false))
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let mut entries = self.lock();
        let next = match entries.get(key) {
            Some(entry) if !entry.expired() => entry
                .value
                .parse::<i64>()
                .map_err(|_| KvError::Backend(format!("key {key} holds a non-integer value")))?
                + 1,
            _ => 1,
        };
        let expires_at = if next == 1 {
            None
        } else {
            entries.get(key).and_then(|e| e.expires_at)
        };
        entries.insert(key.to_owned(), InMemoryEntry { value: next.to_string(), expires_at });
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        if let Some(entry) = self.lock().get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }
}
