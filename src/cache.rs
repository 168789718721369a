// =============================================================================
// Distributed Cache — shared state across engine instances
// =============================================================================
//
// The distributed cache is the single source of truth for leader identity and
// the latest per-pair price. Access goes through the `CacheStore` capability
// trait so the engine can run against Redis in production and an in-memory
// map in tests and single-node deployments.
//
// Well-known keys:
//   market_data:<pair>        — latest MarketData snapshot (TTL 15 s)
//   price:dist:<pair>:latest  — latest PriceUpdate from the stream (TTL 300 s)
//   price_stream:leader       — LeaderLease (TTL 30 s)
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;

pub const MARKET_DATA_PREFIX: &str = "market_data:";
pub const PRICE_DIST_PREFIX: &str = "price:dist:";
pub const LEADER_KEY: &str = "price_stream:leader";

pub fn market_data_key(pair: &str) -> String {
    format!("{MARKET_DATA_PREFIX}{pair}")
}

pub fn price_dist_key(pair: &str) -> String {
    format!("{PRICE_DIST_PREFIX}{pair}:latest")
}

/// String-valued shared cache with per-key TTL.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    /// Atomic set-if-absent. Returns `true` when this call created the key.
    /// The leader lease depends on this being a single atomic operation.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
    async fn delete(&self, key: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

/// Redis-backed cache using a multiplexed connection manager (reconnects
/// transparently).
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("redis GET failed")?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<()>(&mut conn)
            .await
            .context("redis SET failed")?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        // SET NX returns nil when the key already exists.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .context("redis SET NX failed")?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .context("redis DEL failed")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Process-local cache with the same TTL semantics. Backs tests and
/// single-instance deployments without Redis.
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
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let fresh = entries
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map(|(value, _)| value.clone());
        if fresh.is_none() {
            entries.remove(key);
        }
        Ok(fresh)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let occupied = entries
            .get(key)
            .map(|(_, expires)| *expires > now)
            .unwrap_or(false);
        if occupied {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_cache_roundtrip() {
        let cache = MemoryCache::new();
        cache
            .set("k", "v", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_cache_expires() {
        let cache = MemoryCache::new();
        cache
            .set("k", "v", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_if_absent_is_exclusive() {
        let cache = MemoryCache::new();
        assert!(cache
            .set_if_absent("k", "a", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!cache
            .set_if_absent("k", "b", Duration::from_secs(10))
            .await
            .unwrap());
        assert_eq!(cache.get("k").await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn set_if_absent_succeeds_after_expiry() {
        let cache = MemoryCache::new();
        assert!(cache
            .set_if_absent("k", "a", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache
            .set_if_absent("k", "b", Duration::from_secs(10))
            .await
            .unwrap());
    }

    #[test]
    fn key_builders() {
        assert_eq!(market_data_key("BTC/USD"), "market_data:BTC/USD");
        assert_eq!(price_dist_key("BTC/USD"), "price:dist:BTC/USD:latest");
    }
}
