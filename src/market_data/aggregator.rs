// =============================================================================
// MarketDataAggregator — three-tier MarketData resolver
// =============================================================================
//
// Resolution order for `get_market_data`:
//   1. In-process cache when the last fetch is younger than `cache_ttl`.
//   2. When another fetch is in flight, wait for it (poll 100 ms, cap 5 s)
//      and re-read the cache.
//   3. Batched REST fetch: batches of at most 10 pairs, at most 3 batches in
//      flight. Per pair the distributed cache is consulted first; a miss
//      falls through to the ticker endpoint and refreshes the distributed
//      cache.
//
// A per-pair failure never aborts a batch — the pair is simply absent from
// the result and `fetch_errors` is incremented. The aggregator owns its own
// direct REST client, so its ~15 requests/minute never dent the shared
// exchange rate budget.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::cache::{market_data_key, CacheStore};
use crate::exchange::ExchangeAdapter;
use crate::types::MarketData;

/// Maximum pairs per REST batch.
const BATCH_SIZE: usize = 10;
/// Maximum batches resolved concurrently.
const MAX_CONCURRENT_BATCHES: usize = 3;
/// Poll interval while waiting on an in-flight fetch.
const WAIT_POLL: Duration = Duration::from_millis(100);
/// Upper bound on waiting for an in-flight fetch.
const WAIT_CAP: Duration = Duration::from_secs(5);

pub struct MarketDataAggregator {
    exchange: Arc<dyn ExchangeAdapter>,
    dist_cache: Arc<dyn CacheStore>,
    cache_ttl: Duration,
    stale_ttl_ms: i64,
    dist_ttl: Duration,
    local: RwLock<HashMap<String, MarketData>>,
    last_fetch: RwLock<Option<Instant>>,
    is_fetching: AtomicBool,
    fetch_errors: AtomicU64,
}

impl MarketDataAggregator {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        dist_cache: Arc<dyn CacheStore>,
        cache_ttl: Duration,
        stale_ttl_ms: i64,
        dist_ttl: Duration,
    ) -> Self {
        Self {
            exchange,
            dist_cache,
            cache_ttl,
            stale_ttl_ms,
            dist_ttl,
            local: RwLock::new(HashMap::new()),
            last_fetch: RwLock::new(None),
            is_fetching: AtomicBool::new(false),
            fetch_errors: AtomicU64::new(0),
        }
    }

    /// Fresh market data for `pairs`. Never fails; missing pairs are simply
    /// absent from the result.
    pub async fn get_market_data(&self, pairs: &[String]) -> HashMap<String, MarketData> {
        // Tier 1: fresh in-process cache.
        if !self.is_cache_stale() {
            return self.subset(pairs);
        }

        // Tier 2: another fetch is already in flight — wait for it.
        if self.is_fetching.load(Ordering::SeqCst) {
            let start = Instant::now();
            while self.is_fetching.load(Ordering::SeqCst) && start.elapsed() < WAIT_CAP {
                tokio::time::sleep(WAIT_POLL).await;
            }
            return self.subset(pairs);
        }

        // Tier 3: fetch ourselves.
        self.fetch_fresh(pairs).await;
        self.subset(pairs)
    }

    /// `true` when the last fetch is older than the stale TTL (or never ran).
    pub fn is_cache_stale(&self) -> bool {
        match *self.last_fetch.read() {
            Some(at) => at.elapsed() > self.cache_ttl,
            None => true,
        }
    }

    pub fn fetch_errors(&self) -> u64 {
        self.fetch_errors.load(Ordering::Relaxed)
    }

    /// Latest cached snapshot for one pair, if still valid.
    pub fn cached(&self, pair: &str) -> Option<MarketData> {
        let local = self.local.read();
        let data = local.get(pair)?;
        data.is_valid(self.stale_ttl_ms, Utc::now()).then(|| data.clone())
    }

    /// Always performs the batched fetch (used by the background refresher).
    /// A concurrent call is a no-op thanks to the in-flight guard.
    pub async fn fetch_fresh(&self, pairs: &[String]) {
        if self.is_fetching.swap(true, Ordering::SeqCst) {
            debug!("fetch already in flight — skipping");
            return;
        }

        for group in pairs.chunks(BATCH_SIZE * MAX_CONCURRENT_BATCHES) {
            let batches: Vec<_> = group
                .chunks(BATCH_SIZE)
                .map(|batch| self.fetch_batch(batch))
                .collect();
            join_all(batches).await;
        }

        *self.last_fetch.write() = Some(Instant::now());
        self.is_fetching.store(false, Ordering::SeqCst);
    }

    async fn fetch_batch(&self, pairs: &[String]) {
        for pair in pairs {
            match self.resolve_pair(pair).await {
                Some(data) => {
                    self.local.write().insert(pair.clone(), data);
                }
                None => {
                    // Transient; the next tick retries. Logged at debug to
                    // avoid spam.
                    self.fetch_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(pair = %pair, "market data unavailable this cycle");
                }
            }
        }
    }

    /// Distributed cache first, ticker on miss. Stored under the original
    /// (non-wire) pair.
    async fn resolve_pair(&self, pair: &str) -> Option<MarketData> {
        let key = market_data_key(pair);

        if let Ok(Some(raw)) = self.dist_cache.get(&key).await {
            if let Ok(data) = serde_json::from_str::<MarketData>(&raw) {
                if data.is_valid(self.stale_ttl_ms, Utc::now()) {
                    return Some(MarketData {
                        pair: pair.to_string(),
                        ..data
                    });
                }
            }
        }

        match self.exchange.get_ticker(pair).await {
            Ok(mut data) => {
                data.pair = pair.to_string();
                if let Ok(raw) = serde_json::to_string(&data) {
                    if let Err(e) = self.dist_cache.set(&key, &raw, self.dist_ttl).await {
                        debug!(pair = %pair, error = %e, "distributed cache write failed");
                    }
                }
                Some(data)
            }
            Err(e) => {
                debug!(pair = %pair, error = %e, "ticker fetch failed");
                None
            }
        }
    }

    fn subset(&self, pairs: &[String]) -> HashMap<String, MarketData> {
        let local = self.local.read();
        let now = Utc::now();
        pairs
            .iter()
            .filter_map(|p| {
                local
                    .get(p)
                    .filter(|d| d.is_valid(self.stale_ttl_ms, now))
                    .map(|d| (p.clone(), d.clone()))
            })
            .collect()
    }

    /// Feed a stream tick straight into the in-process cache so follower
    /// instances see prices without a REST roundtrip.
    pub fn apply_update(&self, pair: &str, price: f64, bid: Option<f64>, ask: Option<f64>) {
        if price <= 0.0 {
            warn!(pair, price, "ignoring non-positive stream price");
            return;
        }
        let mut local = self.local.write();
        let entry = local.entry(pair.to_string()).or_insert_with(|| MarketData {
            pair: pair.to_string(),
            price,
            bid: bid.unwrap_or(0.0),
            ask: ask.unwrap_or(0.0),
            volume: 0.0,
            change_24h: 0.0,
            high_24h: 0.0,
            low_24h: 0.0,
            timestamp: Utc::now(),
        });
        entry.price = price;
        if let Some(b) = bid {
            entry.bid = b;
        }
        if let Some(a) = ask {
            entry.ask = a;
        }
        entry.timestamp = Utc::now();
    }
}
