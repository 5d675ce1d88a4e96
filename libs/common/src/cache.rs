//! Redis cache module for the file service
//!
//! This module provides the Redis connection wrapper used for sessions and
//! job queues, and the [`TtlStore`] capability: a key-value store whose
//! entries expire after a fixed number of seconds. Besides Redis, an
//! in-memory implementation driven by an injectable [`Clock`] is provided.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{CacheError, CacheResult};

/// Configuration for Redis connection
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

impl RedisConfig {
    /// Create a new RedisConfig from environment variables
    ///
    /// # Environment Variables
    /// - `REDIS_URL`: Redis connection URL (default: "redis://localhost:6379")
    /// - `REDIS_MAX_CONNECTIONS`: Maximum number of connections (default: 10)
    pub fn from_env() -> anyhow::Result<Self> {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let max_connections = std::env::var("REDIS_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        Ok(RedisConfig {
            url,
            max_connections,
        })
    }
}

/// Redis connection pool
#[derive(Clone)]
pub struct RedisPool {
    client: Client,
}

impl RedisPool {
    /// Initialize a new Redis connection pool
    pub async fn new(config: &RedisConfig) -> CacheResult<Self> {
        let client = Client::open(config.url.clone()).map_err(CacheError::Connection)?;
        info!("Redis client initialized with URL: {}", config.url);
        Ok(RedisPool { client })
    }

    /// Get a connection from the pool
    async fn get_connection(&self) -> CacheResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(CacheError::Connection)
    }

    /// Set a key-value pair in Redis with optional TTL
    pub async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> CacheResult<()> {
        let mut conn = self.get_connection().await?;

        if let Some(ttl) = ttl_seconds {
            let _: () = conn
                .set_ex(key, value, ttl)
                .await
                .map_err(CacheError::Command)?;
        } else {
            let _: () = conn.set(key, value).await.map_err(CacheError::Command)?;
        }

        Ok(())
    }

    /// Get a value from Redis by key
    pub async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.get_connection().await?;
        let value: Option<String> = conn.get(key).await.map_err(CacheError::Command)?;
        Ok(value)
    }

    /// Delete a key from Redis
    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.get_connection().await?;
        let _: u64 = conn.del(key).await.map_err(CacheError::Command)?;
        Ok(())
    }

    /// Push a value onto the head of a list
    pub async fn push_front(&self, key: &str, value: &str) -> CacheResult<()> {
        let mut conn = self.get_connection().await?;
        let _: u64 = conn.lpush(key, value).await.map_err(CacheError::Command)?;
        Ok(())
    }

    /// Atomically move the tail of `source` onto the head of `destination`,
    /// blocking up to `timeout` while `source` is empty.
    pub async fn move_blocking(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> CacheResult<Option<String>> {
        let mut conn = self.get_connection().await?;
        let moved: Option<String> = redis::cmd("BLMOVE")
            .arg(source)
            .arg(destination)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await
            .map_err(CacheError::Command)?;
        Ok(moved)
    }

    /// Move every element of `source` onto `destination`, returning how many moved
    pub async fn move_all(&self, source: &str, destination: &str) -> CacheResult<u64> {
        let mut conn = self.get_connection().await?;
        let mut moved = 0;
        loop {
            let value: Option<String> = redis::cmd("LMOVE")
                .arg(source)
                .arg(destination)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await
                .map_err(CacheError::Command)?;
            if value.is_none() {
                return Ok(moved);
            }
            moved += 1;
        }
    }

    /// Remove the first occurrence of `value` from a list
    pub async fn remove(&self, key: &str, value: &str) -> CacheResult<u64> {
        let mut conn = self.get_connection().await?;
        let removed: u64 = conn.lrem(key, 1, value).await.map_err(CacheError::Command)?;
        Ok(removed)
    }

    /// Length of a list, zero when the key does not exist
    pub async fn list_len(&self, key: &str) -> CacheResult<u64> {
        let mut conn = self.get_connection().await?;
        let len: u64 = conn.llen(key).await.map_err(CacheError::Command)?;
        Ok(len)
    }

    /// Add `member` to a sorted set under `score`
    pub async fn schedule(&self, key: &str, member: &str, score: i64) -> CacheResult<()> {
        let mut conn = self.get_connection().await?;
        let _: u64 = conn
            .zadd(key, member, score)
            .await
            .map_err(CacheError::Command)?;
        Ok(())
    }

    /// Members of a sorted set scored at most `max_score`, lowest first
    pub async fn due(&self, key: &str, max_score: i64) -> CacheResult<Vec<String>> {
        let mut conn = self.get_connection().await?;
        let members: Vec<String> = conn
            .zrangebyscore(key, "-inf", max_score)
            .await
            .map_err(CacheError::Command)?;
        Ok(members)
    }

    /// Remove `member` from a sorted set; `false` when it was already gone
    pub async fn unschedule(&self, key: &str, member: &str) -> CacheResult<bool> {
        let mut conn = self.get_connection().await?;
        let removed: u64 = conn.zrem(key, member).await.map_err(CacheError::Command)?;
        Ok(removed == 1)
    }

    /// Lowest score in a sorted set
    pub async fn next_score(&self, key: &str) -> CacheResult<Option<i64>> {
        let mut conn = self.get_connection().await?;
        let first: Vec<(String, f64)> = conn
            .zrange_withscores(key, 0, 0)
            .await
            .map_err(CacheError::Command)?;
        Ok(first.first().map(|(_, score)| *score as i64))
    }

    /// Size of a sorted set, zero when the key does not exist
    pub async fn sorted_len(&self, key: &str) -> CacheResult<u64> {
        let mut conn = self.get_connection().await?;
        let len: u64 = conn.zcard(key).await.map_err(CacheError::Command)?;
        Ok(len)
    }

    /// Check if Redis is reachable
    pub async fn health_check(&self) -> CacheResult<bool> {
        let mut conn = self.get_connection().await?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(CacheError::Command)?;
        Ok(pong == "PONG")
    }
}

/// Key-value store with per-entry expiry
#[async_trait]
pub trait TtlStore: Send + Sync {
    /// Store `value` under `key`, expiring after `ttl_seconds`
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> CacheResult<()>;

    /// Read a live value; expired and missing keys are both `None`
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Remove a key. Removing a missing key succeeds.
    async fn delete(&self, key: &str) -> CacheResult<()>;
}

#[async_trait]
impl TtlStore for RedisPool {
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> CacheResult<()> {
        self.set(key, value, Some(ttl_seconds)).await
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        RedisPool::get(self, key).await
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        RedisPool::delete(self, key).await
    }
}

/// Source of the current time for expiring entries
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: StdMutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: StdMutex::new(start),
        }
    }

    /// Move the clock forward by `by`
    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug)]
struct TtlEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-process [`TtlStore`]
///
/// Expired entries are dropped lazily when read.
#[derive(Clone)]
pub struct MemoryTtlStore {
    clock: Arc<dyn Clock>,
    entries: Arc<Mutex<HashMap<String, TtlEntry>>>,
}

impl MemoryTtlStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of entries still held, live or not yet collected
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryTtlStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TtlStore for MemoryTtlStore {
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> CacheResult<()> {
        let ttl = i64::try_from(ttl_seconds)
            .map(chrono::Duration::seconds)
            .unwrap_or(chrono::Duration::MAX);
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.entries.lock().await.insert(
            key.to_string(),
            TtlEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut entries = self.entries.lock().await;
        let now = self.clock.now();

        let expired = match entries.get(key) {
            Some(entry) if now < entry.expires_at => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_store() -> (Arc<ManualClock>, MemoryTtlStore) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryTtlStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_memory_store_expires_entries() -> CacheResult<()> {
        let (clock, store) = manual_store();

        store.set_ex("key", "value", 10).await?;
        clock.advance(Duration::from_secs(9));
        assert_eq!(store.get("key").await?, Some("value".to_string()));

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get("key").await?, None);
        assert!(store.is_empty().await);
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_store_reads_do_not_extend_expiry() -> CacheResult<()> {
        let (clock, store) = manual_store();

        store.set_ex("key", "value", 10).await?;
        for _ in 0..3 {
            clock.advance(Duration::from_secs(3));
            assert!(store.get("key").await?.is_some());
        }
        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get("key").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_store_overwrite_resets_expiry() -> CacheResult<()> {
        let (clock, store) = manual_store();

        store.set_ex("key", "first", 5).await?;
        clock.advance(Duration::from_secs(4));
        store.set_ex("key", "second", 5).await?;
        clock.advance(Duration::from_secs(4));
        assert_eq!(store.get("key").await?, Some("second".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_store_delete_missing_key_is_noop() -> CacheResult<()> {
        let store = MemoryTtlStore::new();
        store.delete("missing").await?;

        store.set_ex("key", "value", 60).await?;
        store.delete("key").await?;
        store.delete("key").await?;
        assert_eq!(store.get("key").await?, None);
        Ok(())
    }

    #[tokio::test]
    #[ignore = "requires a running Redis instance"]
    async fn test_redis_connection() -> CacheResult<()> {
        let config = RedisConfig {
            url: "redis://localhost:6379".to_string(),
            max_connections: 10,
        };

        let pool = RedisPool::new(&config).await?;
        assert!(pool.health_check().await?);
        Ok(())
    }

    #[tokio::test]
    #[ignore = "requires a running Redis instance"]
    async fn test_redis_set_get_delete() -> CacheResult<()> {
        let config = RedisConfig {
            url: "redis://localhost:6379".to_string(),
            max_connections: 10,
        };

        let pool = RedisPool::new(&config).await?;

        let key = "test_key";
        pool.set_ex(key, "test_value", 5).await?;
        assert_eq!(
            TtlStore::get(&pool, key).await?,
            Some("test_value".to_string())
        );

        TtlStore::delete(&pool, key).await?;
        assert_eq!(TtlStore::get(&pool, key).await?, None);
        Ok(())
    }
}
