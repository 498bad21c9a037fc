use async_trait::async_trait;
use miette::Diagnostic;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Error, Diagnostic)]
pub enum CacheError {
    #[error("Cache store unreachable: {0}")]
    #[diagnostic(code(waypoint::cache::unavailable))]
    Unavailable(String),

    #[error("Cache operation timed out after {0:?}")]
    #[diagnostic(code(waypoint::cache::timeout))]
    Timeout(Duration),
}

impl From<redis::RedisError> for CacheError {
    fn from(value: redis::RedisError) -> Self {
        CacheError::Unavailable(value.to_string())
    }
}

/// Boundary to the external TTL-bearing key-value store. The gateway defines
/// key shapes and TTLs; expiry is store-native and there is no background sweep.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Idempotent upsert with TTL, so racing writers and cancelled requests
    /// cannot corrupt an entry.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Scan for keys under a prefix and delete them in one batch.
    /// Returns the number of keys deleted.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError>;
}

/// Redis-backed store. Every operation carries a bounded timeout; a slow
/// cache converts to a `CacheError` and the caller's documented fallback.
pub struct RedisCache {
    manager: ConnectionManager,
    op_timeout: Duration,
}

impl RedisCache {
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(CacheError::from)?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(CacheError::from)?;
        info!(url, "Connected to cache store");
        Ok(Self {
            manager,
            op_timeout,
        })
    }

    async fn timed<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, redis::RedisError>> + Send,
    ) -> Result<T, CacheError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::Timeout(self.op_timeout)),
        }
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.manager.clone();
        self.timed(async move { conn.get::<_, Option<String>>(key).await })
            .await
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let seconds = ttl.as_secs().max(1);
        self.timed(async move { conn.set_ex::<_, _, ()>(key, value, seconds).await })
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        self.timed(async move { conn.del::<_, ()>(key).await }).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let pattern = format!("{prefix}*");
        let mut conn = self.manager.clone();
        let op = async move {
            let mut keys: Vec<String> = Vec::new();
            {
                let mut iter = conn.scan_match::<_, String>(&pattern).await?;
                while let Some(key) = iter.next_item().await {
                    keys.push(key);
                }
            }
            if keys.is_empty() {
                return Ok(0);
            }
            let count = keys.len();
            conn.del::<_, ()>(keys).await?;
            Ok(count)
        };
        self.timed(op).await
    }
}

/// In-process store with the same TTL semantics, used in tests and as a
/// degraded fallback when the configured cache store is unreachable at startup.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => {
                Ok(Some(value.clone()))
            }
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut entries = self.entries.lock().await;
        let matching: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        let count = matching.len();
        for key in matching {
            entries.remove(&key);
        }
        debug!(prefix, count, "Deleted cache entries by prefix");
        Ok(count)
    }
}
