//! Account cache
//!
//! Memoizes `getAccountInfo` responses keyed by `account:{address}:{encoding}`.
//! Backed by Redis in production or an in-process map. Every failure is
//! logged and reads as a miss, so a broken cache degrades to "always fetch".
//!
//! Each successful write is broadcast so a waiting RPC request can wake up
//! as soon as a device answers instead of sleeping out the full wait.

use std::collections::HashMap;
use std::time::Duration;

use redis::AsyncCommands;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;

/// Redis/Memory key for an account response.
pub fn account_cache_key(address: &str, encoding: &str) -> String {
    format!("account:{}:{}", address, encoding)
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// In-process store with per-entry expiry.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (Value, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, expires_at)) if *expires_at > now => return Some(value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: drop it so it is absent, not merely stale.
        let mut entries = self.entries.write().await;
        if let Some((_, expires_at)) = entries.get(key) {
            if *expires_at <= now {
                entries.remove(key);
            }
        }
        None
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries.write().await.insert(key.to_string(), (value, expires_at));
    }

    async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }
}

/// Redis store; values are JSON strings written with `SET .. EX`.
#[derive(Clone)]
pub struct RedisCache {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(value)?;
        // Redis expiry has second granularity and rejects 0.
        let secs = ttl.as_secs().max(1);
        let _: () = conn.set_ex(key, json, secs).await?;
        Ok(())
    }
}

pub enum CacheBackend {
    Redis(RedisCache),
    Memory(MemoryCache),
}

pub struct AccountCache {
    backend: CacheBackend,
    writes: broadcast::Sender<String>,
}

impl AccountCache {
    pub fn new(backend: CacheBackend) -> Self {
        let (writes, _) = broadcast::channel(256);
        Self { backend, writes }
    }

    pub fn memory() -> Self {
        Self::new(CacheBackend::Memory(MemoryCache::new()))
    }

    pub async fn redis(url: &str) -> Result<Self, CacheError> {
        Ok(Self::new(CacheBackend::Redis(RedisCache::connect(url).await?)))
    }

    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            CacheBackend::Redis(_) => "redis",
            CacheBackend::Memory(_) => "memory",
        }
    }

    /// Cached value for `key`, or `None` on miss, expiry or cache failure.
    pub async fn get(&self, key: &str) -> Option<Value> {
        match &self.backend {
            CacheBackend::Memory(m) => m.get(key).await,
            CacheBackend::Redis(r) => match r.get(key).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("Error retrieving cached data for key {}: {}", key, e);
                    None
                }
            },
        }
    }

    /// Store `value` for `ttl`. Failures are logged and swallowed.
    pub async fn set(&self, key: &str, value: Value, ttl: Duration) {
        let stored = match &self.backend {
            CacheBackend::Memory(m) => {
                m.set(key, value, ttl).await;
                true
            }
            CacheBackend::Redis(r) => match r.set(key, &value, ttl).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Error caching data for key {}: {}", key, e);
                    false
                }
            },
        };

        if stored {
            // No receivers is the normal case.
            let _ = self.writes.send(key.to_string());
        }
    }

    /// Subscribe to written keys. Subscribe before triggering the work whose
    /// result you want to observe, then call [`AccountCache::wait_for_key`].
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.writes.subscribe()
    }

    /// Resolves once `key` has been written. A lagged receiver may have
    /// missed the write, so it re-checks the cache and keeps waiting on a
    /// miss. Never resolves if the key is never written; bound it with a
    /// timeout.
    pub async fn wait_for_key(&self, rx: &mut broadcast::Receiver<String>, key: &str) {
        loop {
            match rx.recv().await {
                Ok(written) if written == key => return,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Cache notifications lagged by {}, re-checking {}", skipped, key);
                    if self.get(key).await.is_some() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Number of live entries (memory backend only).
    pub async fn len(&self) -> Option<usize> {
        match &self.backend {
            CacheBackend::Memory(m) => Some(m.len().await),
            CacheBackend::Redis(_) => None,
        }
    }
}
