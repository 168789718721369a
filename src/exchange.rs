// =============================================================================
// Exchange Adapter — capability contract + HMAC-SHA256 signed REST client
// =============================================================================
//
// The engine consumes exchanges through the narrow `ExchangeAdapter` trait;
// the wire protocol lives behind it. The bundled implementation speaks the
// Binance-style spot REST API with HMAC-SHA256 request signing.
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry the API key as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift.
// =============================================================================

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::types::{wire_symbol, Candle, MarketData, Side};

type HmacSha256 = Hmac<Sha256>;

/// recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5_000;

/// Per-call timeouts. Ticker reads sit on the hot path, order placement may
/// legitimately take longer.
const TICKER_TIMEOUT: Duration = Duration::from_secs(2);
const OHLC_TIMEOUT: Duration = Duration::from_secs(5);
const ORDER_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Capability contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub pair: String,
    pub side: Side,
    pub amount: f64,
    /// Limit price; `None` places a market order.
    pub price: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct OrderFill {
    pub order_id: String,
    pub avg_price: f64,
    pub fee: f64,
    pub fee_asset: String,
}

#[derive(Debug, Clone)]
pub struct AssetBalance {
    pub asset: String,
    pub total: f64,
}

/// The capability set the engine needs from any exchange.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn get_ticker(&self, pair: &str) -> Result<MarketData>;
    async fn get_ohlcv(&self, pair: &str, timeframe: &str, limit: u32) -> Result<Vec<Candle>>;
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderFill>;
    async fn get_balances(&self) -> Result<Vec<AssetBalance>>;
}

// ---------------------------------------------------------------------------
// Signed REST implementation
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RestExchange {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl RestExchange {
    /// Build a client. The API key rides as a default header on every
    /// request; the secret is used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            secret,
            base_url: "https://api.binance.com".to_string(),
            client,
        }
    }

    /// Override the API host (testnet, regional mirror).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Full query string for a signed request (timestamp + recvWindow +
    /// signature appended).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn get_json(
        &self,
        url: &str,
        timeout: Duration,
        what: &str,
    ) -> Result<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("{what} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {what} response"))?;

        if !status.is_success() {
            anyhow::bail!("{what} returned {status}: {body}");
        }
        Ok(body)
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .with_context(|| format!("failed to parse '{s}' as f64"))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            anyhow::bail!("expected string or number, got: {val}")
        }
    }
}

#[async_trait]
impl ExchangeAdapter for RestExchange {
    async fn get_ticker(&self, pair: &str) -> Result<MarketData> {
        let symbol = wire_symbol(pair);
        let url = format!("{}/api/v3/ticker/24hr?symbol={}", self.base_url, symbol);
        let body = self.get_json(&url, TICKER_TIMEOUT, "GET ticker/24hr").await?;

        let data = MarketData {
            pair: pair.to_string(),
            price: Self::parse_str_f64(&body["lastPrice"])?,
            bid: Self::parse_str_f64(&body["bidPrice"]).unwrap_or(0.0),
            ask: Self::parse_str_f64(&body["askPrice"]).unwrap_or(0.0),
            volume: Self::parse_str_f64(&body["volume"]).unwrap_or(0.0),
            change_24h: Self::parse_str_f64(&body["priceChangePercent"]).unwrap_or(0.0),
            high_24h: Self::parse_str_f64(&body["highPrice"]).unwrap_or(0.0),
            low_24h: Self::parse_str_f64(&body["lowPrice"]).unwrap_or(0.0),
            timestamp: Utc::now(),
        };

        debug!(pair, price = data.price, "ticker fetched");
        Ok(data)
    }

    /// GET /api/v3/klines (public). Array indices: [0] openTime, [1] open,
    /// [2] high, [3] low, [4] close, [5] volume, [6] closeTime.
    async fn get_ohlcv(&self, pair: &str, timeframe: &str, limit: u32) -> Result<Vec<Candle>> {
        let symbol = wire_symbol(pair);
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, timeframe, limit
        );
        let body = self.get_json(&url, OHLC_TIMEOUT, "GET klines").await?;

        let raw = body.as_array().context("klines response is not an array")?;
        let mut candles = Vec::with_capacity(raw.len());

        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 7 {
                warn!(elements = arr.len(), "skipping malformed kline entry");
                continue;
            }
            candles.push(Candle::new(
                arr[0].as_i64().unwrap_or(0),
                arr[6].as_i64().unwrap_or(0),
                Self::parse_str_f64(&arr[1])?,
                Self::parse_str_f64(&arr[2])?,
                Self::parse_str_f64(&arr[3])?,
                Self::parse_str_f64(&arr[4])?,
                Self::parse_str_f64(&arr[5])?,
            ));
        }

        debug!(pair, timeframe, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// POST /api/v3/order (signed). Market order unless a price is given.
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderFill> {
        let symbol = wire_symbol(&req.pair);
        let side = match req.side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };

        let mut params = format!("symbol={symbol}&side={side}&quantity={}", req.amount);
        match req.price {
            Some(p) => params.push_str(&format!("&type=LIMIT&timeInForce=GTC&price={p}")),
            None => params.push_str("&type=MARKET"),
        }

        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(pair = %req.pair, side, amount = req.amount, "placing order");

        let resp = self
            .client
            .post(&url)
            .timeout(ORDER_TIMEOUT)
            .send()
            .await
            .context("POST order request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse order response")?;

        if !status.is_success() {
            anyhow::bail!("POST order returned {status}: {body}");
        }

        // Average fill price and summed commission across partial fills.
        let fills = body["fills"].as_array().cloned().unwrap_or_default();
        let mut filled_qty = 0.0;
        let mut notional = 0.0;
        let mut fee = 0.0;
        let mut fee_asset = String::new();

        for fill in &fills {
            let price = Self::parse_str_f64(&fill["price"]).unwrap_or(0.0);
            let qty = Self::parse_str_f64(&fill["qty"]).unwrap_or(0.0);
            filled_qty += qty;
            notional += price * qty;
            fee += Self::parse_str_f64(&fill["commission"]).unwrap_or(0.0);
            if fee_asset.is_empty() {
                if let Some(asset) = fill["commissionAsset"].as_str() {
                    fee_asset = asset.to_string();
                }
            }
        }

        let avg_price = if filled_qty > 0.0 {
            notional / filled_qty
        } else {
            req.price.unwrap_or(0.0)
        };

        let order_id = body["orderId"]
            .as_u64()
            .map(|id| id.to_string())
            .unwrap_or_else(|| body["clientOrderId"].as_str().unwrap_or("").to_string());

        debug!(pair = %req.pair, order_id = %order_id, avg_price, fee, "order placed");

        Ok(OrderFill {
            order_id,
            avg_price,
            fee,
            fee_asset,
        })
    }

    /// GET /api/v3/account (signed). Free + locked summed per asset.
    async fn get_balances(&self) -> Result<Vec<AssetBalance>> {
        let qs = self.signed_query("");
        let url = format!("{}/api/v3/account?{}", self.base_url, qs);
        let body = self.get_json(&url, OHLC_TIMEOUT, "GET account").await?;

        let balances = body["balances"]
            .as_array()
            .context("account response missing 'balances' array")?;

        let mut out = Vec::new();
        for b in balances {
            let asset = b["asset"].as_str().unwrap_or("").to_string();
            let free = Self::parse_str_f64(&b["free"]).unwrap_or(0.0);
            let locked = Self::parse_str_f64(&b["locked"]).unwrap_or(0.0);
            let total = free + locked;
            if total > 0.0 && !asset.is_empty() {
                out.push(AssetBalance { asset, total });
            }
        }

        debug!(assets = out.len(), "balances retrieved");
        Ok(out)
    }
}

impl std::fmt::Debug for RestExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestExchange")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let client = RestExchange::new("key", "secret");
        let sig = client.sign("symbol=BTCUSDT&side=BUY");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sig, client.sign("symbol=BTCUSDT&side=BUY"));
        assert_ne!(sig, client.sign("symbol=BTCUSDT&side=SELL"));
    }

    #[test]
    fn signed_query_shape() {
        let client = RestExchange::new("key", "secret");
        let qs = client.signed_query("symbol=BTCUSDT");
        assert!(qs.starts_with("symbol=BTCUSDT&timestamp="));
        assert!(qs.contains("&recvWindow=5000&"));
        assert!(qs.contains("&signature="));
    }

    #[test]
    fn parse_str_f64_accepts_both_shapes() {
        assert_eq!(
            RestExchange::parse_str_f64(&serde_json::json!("93200.5")).unwrap(),
            93200.5
        );
        assert_eq!(
            RestExchange::parse_str_f64(&serde_json::json!(42.0)).unwrap(),
            42.0
        );
        assert!(RestExchange::parse_str_f64(&serde_json::json!(null)).is_err());
        assert!(RestExchange::parse_str_f64(&serde_json::json!("nope")).is_err());
    }

    #[test]
    fn debug_redacts_secret() {
        let client = RestExchange::new("key", "supersecret");
        let rendered = format!("{client:?}");
        assert!(!rendered.contains("supersecret"));
        assert!(rendered.contains("<redacted>"));
    }
}
