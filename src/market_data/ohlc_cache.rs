// =============================================================================
// OHLC Cache — TTL cache in front of the exchange adapter
// =============================================================================
//
// Candle fetches are keyed by `(pair, timeframe, limit)`. Regime detection,
// indicator computation, and the momentum passes all read through here so the
// main tick never performs the same OHLC fetch twice within the TTL.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::RwLock;
use tracing::debug;

use crate::exchange::ExchangeAdapter;
use crate::types::Candle;

type Key = (String, String, u32);

pub struct OhlcCache {
    exchange: Arc<dyn ExchangeAdapter>,
    ttl: Duration,
    entries: RwLock<HashMap<Key, (Vec<Candle>, Instant)>>,
}

impl OhlcCache {
    pub fn new(exchange: Arc<dyn ExchangeAdapter>, ttl: Duration) -> Self {
        Self {
            exchange,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Candles for `(pair, timeframe, limit)`, from cache when fresh.
    pub async fn fetch(&self, pair: &str, timeframe: &str, limit: u32) -> Result<Vec<Candle>> {
        let key = (pair.to_string(), timeframe.to_string(), limit);

        if let Some(candles) = self.cached(&key) {
            return Ok(candles);
        }

        let candles = self.exchange.get_ohlcv(pair, timeframe, limit).await?;
        debug!(pair, timeframe, limit, count = candles.len(), "ohlc fetched");

        self.entries
            .write()
            .insert(key, (candles.clone(), Instant::now()));
        Ok(candles)
    }

    fn cached(&self, key: &Key) -> Option<Vec<Candle>> {
        let entries = self.entries.read();
        let (candles, fetched_at) = entries.get(key)?;
        (fetched_at.elapsed() < self.ttl).then(|| candles.clone())
    }

    /// Drop expired entries. Called opportunistically by the orchestrator.
    pub fn evict_expired(&self) {
        let ttl = self.ttl;
        self.entries
            .write()
            .retain(|_, (_, fetched_at)| fetched_at.elapsed() < ttl);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{AssetBalance, OrderFill, OrderRequest};
    use crate::types::MarketData;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExchange {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExchangeAdapter for CountingExchange {
        async fn get_ticker(&self, _pair: &str) -> Result<MarketData> {
            anyhow::bail!("not used")
        }

        async fn get_ohlcv(&self, _pair: &str, _tf: &str, limit: u32) -> Result<Vec<Candle>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((0..limit as i64)
                .map(|i| Candle::new(i, i, 100.0, 101.0, 99.0, 100.0, 1.0))
                .collect())
        }

        async fn place_order(&self, _req: &OrderRequest) -> Result<OrderFill> {
            anyhow::bail!("not used")
        }

        async fn get_balances(&self) -> Result<Vec<AssetBalance>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn second_fetch_hits_cache() {
        let exchange = Arc::new(CountingExchange {
            calls: AtomicUsize::new(0),
        });
        let cache = OhlcCache::new(exchange.clone(), Duration::from_secs(60));

        let a = cache.fetch("BTC/USD", "1h", 100).await.unwrap();
        let b = cache.fetch("BTC/USD", "1h", 100).await.unwrap();
        assert_eq!(a.len(), 100);
        assert_eq!(b.len(), 100);
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_fetch_separately() {
        let exchange = Arc::new(CountingExchange {
            calls: AtomicUsize::new(0),
        });
        let cache = OhlcCache::new(exchange.clone(), Duration::from_secs(60));

        cache.fetch("BTC/USD", "1h", 100).await.unwrap();
        cache.fetch("BTC/USD", "1h", 50).await.unwrap();
        cache.fetch("ETH/USD", "1h", 100).await.unwrap();
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn expired_entry_is_refetched() {
        let exchange = Arc::new(CountingExchange {
            calls: AtomicUsize::new(0),
        });
        let cache = OhlcCache::new(exchange.clone(), Duration::from_millis(10));

        cache.fetch("BTC/USD", "1h", 100).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.fetch("BTC/USD", "1h", 100).await.unwrap();
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 2);
    }
}
