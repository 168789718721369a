// =============================================================================
// PriceStream — single-leader websocket ticker client
// =============================================================================
//
// Only the lease-holding instance connects to the exchange stream; followers
// see prices through the distributed cache and the pub-sub channels. Each
// ticker event is (a) written to the distributed cache, (b) published on the
// pair channel, and (c) fanned out to local subscribers.
//
// Connection state machine:
//   DISCONNECTED → CONNECTING → CONNECTED → (FAILED | RECONNECTING) → …
//
// Reconnection backs off exponentially from 1 s to 60 s; a circuit breaker
// (5 consecutive failures, 60 s timeout) prevents hot loops. Subscriber
// registrations survive reconnects. An intentional disconnect — including
// loss of leadership — suppresses reconnection entirely.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::cache::{price_dist_key, CacheStore};
use crate::pubsub::PubSubBus;
use crate::types::{pair_from_wire_symbol, price_channel, PriceUpdate};

/// TTL for `price:dist:<pair>:latest` entries.
const PRICE_DIST_TTL: Duration = Duration::from_secs(300);

/// Reconnect backoff bounds.
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

pub type PriceSubscriber = Arc<dyn Fn(&PriceUpdate) + Send + Sync>;

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Trips after `threshold` consecutive failures and stays open for
/// `timeout`. A success resets the count.
pub struct CircuitBreaker {
    threshold: u32,
    timeout: Duration,
    failures: RwLock<u32>,
    open_until: RwLock<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            threshold,
            timeout,
            failures: RwLock::new(0),
            open_until: RwLock::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        let mut open_until = self.open_until.write();
        match *open_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                // Timeout elapsed — half-open: allow the next attempt.
                *open_until = None;
                *self.failures.write() = 0;
                false
            }
            None => false,
        }
    }

    pub fn record_failure(&self) {
        let mut failures = self.failures.write();
        *failures += 1;
        if *failures >= self.threshold {
            *self.open_until.write() = Some(Instant::now() + self.timeout);
            warn!(failures = *failures, "price stream circuit breaker opened");
        }
    }

    pub fn record_success(&self) {
        *self.failures.write() = 0;
        *self.open_until.write() = None;
    }
}

// ---------------------------------------------------------------------------
// PriceStream
// ---------------------------------------------------------------------------

pub struct PriceStream {
    cache: Arc<dyn CacheStore>,
    bus: Arc<dyn PubSubBus>,
    subscribers: RwLock<Vec<PriceSubscriber>>,
    state: RwLock<ConnState>,
    breaker: CircuitBreaker,
    intentional_disconnect: AtomicBool,
    ws_url: String,
}

impl PriceStream {
    pub fn new(cache: Arc<dyn CacheStore>, bus: Arc<dyn PubSubBus>) -> Self {
        Self {
            cache,
            bus,
            subscribers: RwLock::new(Vec::new()),
            state: RwLock::new(ConnState::Disconnected),
            breaker: CircuitBreaker::new(5, Duration::from_secs(60)),
            intentional_disconnect: AtomicBool::new(false),
            ws_url: "wss://stream.binance.com:9443".to_string(),
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state.read()
    }

    /// Register a local subscriber. Registrations persist across reconnects.
    pub fn subscribe_local(&self, subscriber: PriceSubscriber) {
        self.subscribers.write().push(subscriber);
    }

    /// Signal the stream to stop and stay stopped. Loss of leadership calls
    /// this too.
    pub fn disconnect(&self) {
        self.intentional_disconnect.store(true, Ordering::SeqCst);
        *self.state.write() = ConnState::Disconnected;
        info!("price stream disconnect requested");
    }

    /// Re-arm after an intentional disconnect (leadership regained).
    pub fn rearm(&self) {
        self.intentional_disconnect.store(false, Ordering::SeqCst);
    }

    /// Run the stream until an intentional disconnect. Only leaders call
    /// this.
    pub async fn run(&self, pairs: &[String]) {
        let mut backoff = BACKOFF_MIN;

        loop {
            if self.intentional_disconnect.load(Ordering::SeqCst) {
                *self.state.write() = ConnState::Disconnected;
                info!("price stream stopped (intentional)");
                return;
            }

            if self.breaker.is_open() {
                debug!("circuit breaker open — delaying reconnect");
                tokio::time::sleep(BACKOFF_MIN).await;
                continue;
            }

            *self.state.write() = ConnState::Connecting;
            match self.run_connection(pairs).await {
                Ok(()) => {
                    // Clean close; reconnect promptly.
                    backoff = BACKOFF_MIN;
                    *self.state.write() = ConnState::Reconnecting;
                }
                Err(e) => {
                    self.breaker.record_failure();
                    *self.state.write() = ConnState::Failed;
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "price stream error");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                    *self.state.write() = ConnState::Reconnecting;
                }
            }
        }
    }

    async fn run_connection(&self, pairs: &[String]) -> Result<()> {
        let url = build_stream_url(&self.ws_url, pairs);
        debug!(url = %url, "connecting price stream");

        let (ws, _resp) = connect_async(&url)
            .await
            .context("websocket connect failed")?;

        *self.state.write() = ConnState::Connected;
        self.breaker.record_success();
        info!(pairs = pairs.len(), "price stream connected");

        let (_write, mut read) = ws.split();

        while let Some(message) = read.next().await {
            if self.intentional_disconnect.load(Ordering::SeqCst) {
                return Ok(());
            }

            let message = message.context("websocket read failed")?;
            if !message.is_text() {
                continue;
            }
            let text = message.into_text().context("non-text frame")?;

            if let Some(update) = parse_ticker_event(&text, pairs) {
                self.publish(&update).await;
            }
        }

        Ok(())
    }

    /// Fan one update out to the cache, the pair channel, and local
    /// subscribers.
    async fn publish(&self, update: &PriceUpdate) {
        let payload = match serde_json::to_string(update) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "price update serialise failed");
                return;
            }
        };

        if let Err(e) = self
            .cache
            .set(&price_dist_key(&update.pair), &payload, PRICE_DIST_TTL)
            .await
        {
            debug!(pair = %update.pair, error = %e, "distributed price write failed");
        }

        if let Err(e) = self.bus.publish(&price_channel(&update.pair), &payload).await {
            debug!(pair = %update.pair, error = %e, "price publish failed");
        }

        for subscriber in self.subscribers.read().iter() {
            subscriber(update);
        }
    }
}

/// Combined-stream URL for all subscribed pairs.
fn build_stream_url(base: &str, pairs: &[String]) -> String {
    let streams: Vec<String> = pairs
        .iter()
        .map(|p| format!("{}@ticker", crate::types::wire_symbol(p).to_lowercase()))
        .collect();
    format!("{}/stream?streams={}", base, streams.join("/"))
}

/// Parse one combined-stream ticker event into a [`PriceUpdate`].
///
/// Envelope: `{"stream":"btcusdt@ticker","data":{"s":"BTCUSDT","c":"…",
/// "b":"…","a":"…","E":…}}`. The wire symbol is resolved back onto the
/// subscribed pair; unknown symbols and non-positive prices are dropped.
fn parse_ticker_event(text: &str, subscribed: &[String]) -> Option<PriceUpdate> {
    let root: serde_json::Value = serde_json::from_str(text).ok()?;
    let data = if root["data"].is_object() {
        &root["data"]
    } else {
        &root
    };

    let symbol = data["s"].as_str()?;
    let pair = pair_from_wire_symbol(symbol, subscribed)?;

    let price: f64 = data["c"].as_str()?.parse().ok()?;
    if price <= 0.0 {
        return None;
    }

    let bid = data["b"].as_str().and_then(|s| s.parse().ok());
    let ask = data["a"].as_str().and_then(|s| s.parse().ok());
    let spread = match (bid, ask) {
        (Some(b), Some(a)) if b > 0.0 && a >= b => Some((a - b) / b),
        _ => None,
    };

    Some(PriceUpdate {
        pair,
        price,
        bid,
        ask,
        spread,
        timestamp: data["E"].as_i64().unwrap_or(0),
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_uses_wire_symbols() {
        let url = build_stream_url(
            "wss://example",
            &["BTC/USD".to_string(), "ETH/USDT".to_string()],
        );
        assert_eq!(
            url,
            "wss://example/stream?streams=btcusdt@ticker/ethusdt@ticker"
        );
    }

    #[test]
    fn parses_combined_stream_ticker() {
        // S6: BTCUSDT resolves onto the subscribed BTC/USDT pair; price,
        // bid/ask, and the event time are parsed verbatim.
        let text = r#"{
            "stream": "btcusdt@ticker",
            "data": {
                "e": "24hrTicker",
                "E": 1700000000123,
                "s": "BTCUSDT",
                "c": "93200.00",
                "b": "93199.99",
                "a": "93200.00"
            }
        }"#;
        let subscribed = vec!["BTC/USDT".to_string()];
        let update = parse_ticker_event(text, &subscribed).unwrap();

        assert_eq!(update.pair, "BTC/USDT");
        assert_eq!(update.price, 93_200.0);
        assert_eq!(update.bid, Some(93_199.99));
        assert_eq!(update.ask, Some(93_200.0));
        assert_eq!(update.timestamp, 1_700_000_000_123);
        assert!(update.spread.unwrap() > 0.0);
    }

    #[test]
    fn unknown_symbol_is_dropped() {
        let text = r#"{"data":{"s":"DOGEUSDT","c":"0.1","E":1}}"#;
        assert!(parse_ticker_event(text, &["BTC/USD".to_string()]).is_none());
    }

    #[test]
    fn non_positive_price_is_dropped() {
        let text = r#"{"data":{"s":"BTCUSDT","c":"0.0","E":1}}"#;
        assert!(parse_ticker_event(text, &["BTC/USD".to_string()]).is_none());
    }

    #[test]
    fn breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(!breaker.is_open());
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[test]
    fn breaker_half_opens_after_timeout() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        assert!(breaker.is_open());
        std::thread::sleep(Duration::from_millis(30));
        assert!(!breaker.is_open());
    }

    #[test]
    fn breaker_success_resets_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
    }
}
