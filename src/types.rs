// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Pairs
// ---------------------------------------------------------------------------

/// Split a `BASE/QUOTE` pair into its components. Returns `None` when the
/// string is not a two-part pair.
pub fn split_pair(pair: &str) -> Option<(&str, &str)> {
    let mut parts = pair.splitn(2, '/');
    let base = parts.next()?;
    let quote = parts.next()?;
    if base.is_empty() || quote.is_empty() {
        return None;
    }
    Some((base, quote))
}

/// Map an internal pair onto the wire pair an exchange actually lists.
/// Exchanges without USD spot markets quote in USDT, so `BTC/USD` trades as
/// `BTC/USDT` on the wire. The internal (bot-configured) pair stays
/// authoritative everywhere except the I/O boundary.
pub fn normalize_wire_pair(pair: &str) -> String {
    match split_pair(pair) {
        Some((base, "USD")) => format!("{base}/USDT"),
        _ => pair.to_string(),
    }
}

/// Collapse a pair into the concatenated wire symbol (`BTC/USD` → `BTCUSDT`).
pub fn wire_symbol(pair: &str) -> String {
    normalize_wire_pair(pair).replace('/', "").to_uppercase()
}

/// Restore an internal pair from a wire symbol, given the set of pairs we are
/// actually subscribed to. `BTCUSDT` resolves to `BTC/USDT` when that pair is
/// subscribed, or to `BTC/USD` when only the USD alias is.
pub fn pair_from_wire_symbol(symbol: &str, subscribed: &[String]) -> Option<String> {
    let upper = symbol.to_uppercase();
    subscribed
        .iter()
        .find(|p| wire_symbol(p) == upper)
        .cloned()
}

/// Pub-sub channel carrying price updates for one pair
/// (`BTC/USD` → `price_updates_btc_usd`).
pub fn price_channel(pair: &str) -> String {
    format!("price_updates_{}", pair.replace('/', "_").to_lowercase())
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Immutable per-pair market snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketData {
    pub pair: String,
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    pub volume: f64,
    pub change_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub timestamp: DateTime<Utc>,
}

impl MarketData {
    /// A snapshot is usable only when the price is positive and it is younger
    /// than `stale_ttl_ms`.
    pub fn is_valid(&self, stale_ttl_ms: i64, now: DateTime<Utc>) -> bool {
        self.price > 0.0 && (now - self.timestamp).num_milliseconds() <= stale_ttl_ms
    }

    /// Bid/ask spread as a fraction of the bid. `None` when the book side is
    /// missing or crossed.
    pub fn spread_pct(&self) -> Option<f64> {
        if self.bid > 0.0 && self.ask >= self.bid {
            Some((self.ask - self.bid) / self.bid)
        } else {
            None
        }
    }
}

/// Price tick republished by the leader stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub pair: String,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spread: Option<f64>,
    pub timestamp: i64,
}

/// A single OHLCV candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(
        open_time: i64,
        close_time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            open_time,
            close_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// The narrow indicator set the engine consumes. Pure function of recent
/// OHLC; see `indicators::compute_snapshot`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub adx: f64,
    pub adx_slope: f64,
    pub rsi: f64,
    pub momentum_1h: f64,
    pub momentum_4h: f64,
    pub volume_ratio: f64,
    pub intrabar_momentum: f64,
}

// ---------------------------------------------------------------------------
// Regimes
// ---------------------------------------------------------------------------

/// ADX-derived label of a pair's recent trend quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegimeKind {
    Choppy,
    Weak,
    Transitioning,
    Moderate,
    Strong,
}

impl RegimeKind {
    /// Moderate and strong regimes count as trending for the underwater
    /// threshold table.
    pub fn is_trending(self) -> bool {
        matches!(self, Self::Moderate | Self::Strong)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Choppy => "choppy",
            Self::Weak => "weak",
            Self::Transitioning => "transitioning",
            Self::Moderate => "moderate",
            Self::Strong => "strong",
        }
    }
}

impl std::fmt::Display for RegimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification result for one pair. `Transitioning` is a runtime override
/// produced by the entry filter and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Regime {
    pub kind: RegimeKind,
    pub confidence: f64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Bots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotStatus {
    Running,
    Paused,
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Paper,
    Live,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "paper"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// Owner subscription state as read from the billing tables. The engine only
/// acts on bots whose owner is `Active` or `Trialing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    None,
}

impl SubscriptionStatus {
    pub fn is_valid(self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "trialing" => Self::Trialing,
            "past_due" => Self::PastDue,
            "canceled" | "cancelled" => Self::Canceled,
            _ => Self::None,
        }
    }
}

/// Per-bot configuration blob (`bot_instances.config`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Fixed capital budget in quote currency. `0` means unlimited: the
    /// effective balance is fetched from the exchange with a 5 % buffer.
    #[serde(default, deserialize_with = "de_capital")]
    pub initial_capital: f64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            initial_capital: 0.0,
        }
    }
}

/// Accept both a number and the legacy `"unlimited"` string for
/// `initial_capital`.
fn de_capital<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) if n.is_finite() && n > 0.0 => Ok(n),
        Raw::Num(_) => Ok(0.0),
        Raw::Text(_) => Ok(0.0), // "unlimited" and anything else
    }
}

/// A user-configured bot bound to an exchange, a capital budget, and a list
/// of trading pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotInstance {
    pub id: i64,
    pub user_id: i64,
    pub exchange: String,
    pub enabled_pairs: Vec<String>,
    pub status: BotStatus,
    pub trading_mode: TradingMode,
    pub config: BotConfig,
}

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PyramidStatus {
    PendingExecution,
    Filled,
    Failed,
}

/// An add-on entry at a predefined profit milestone. Levels are strictly
/// ordered; level 2 requires level 1 to exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PyramidLevel {
    pub level: u8,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    pub trigger_profit_pct: f64,
    pub status: PyramidStatus,
    pub ai_confidence: f64,
}

/// One spot trade owned by one bot. A bot holds at most one open trade per
/// pair at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub bot_instance_id: i64,
    pub pair: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Entry fee in quote currency.
    pub fee: f64,
    pub pyramid_levels: Vec<PyramidLevel>,
    pub status: TradeStatus,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub profit_loss: Option<f64>,
    pub profit_loss_percent: Option<f64>,
    pub exit_reason: Option<String>,
    pub idempotency_key: String,
    pub trading_mode: TradingMode,
}

impl Trade {
    /// Age in whole minutes, clamped to zero. A future-dated entry time is a
    /// data-quality problem; the caller logs it and treats the trade as new.
    pub fn age_minutes(&self, now: DateTime<Utc>) -> (i64, bool) {
        let raw = (now - self.entry_time).num_minutes();
        if raw < 0 {
            (0, true)
        } else {
            (raw, false)
        }
    }

    /// Gross price-move percentage at `price`.
    pub fn gross_profit_pct(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) / self.entry_price * 100.0
    }
}

/// Deterministic execution key: duplicate fan-outs within the same second
/// collapse onto one row via the UNIQUE index.
pub fn idempotency_key(bot_id: i64, pair: &str, side: Side, ts: DateTime<Utc>) -> String {
    format!("{}:{}:{}:{}", bot_id, pair, side, ts.timestamp())
}

// ---------------------------------------------------------------------------
// Decisions and execution plans
// ---------------------------------------------------------------------------

/// One market-wide trade decision produced by the entry pass. Fanned out to
/// every eligible bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDecision {
    pub pair: String,
    pub side: Side,
    pub confidence: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub regime: RegimeKind,
    pub is_transitioning: bool,
    pub decided_at: DateTime<Utc>,
}

/// A decision instantiated for one bot with a concrete quantity.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub bot_id: i64,
    pub user_id: i64,
    pub exchange: String,
    pub pair: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub trading_mode: TradingMode,
    pub ai_confidence: f64,
    pub idempotency_key: String,
}

// ---------------------------------------------------------------------------
// Exit reasons
// ---------------------------------------------------------------------------

/// Canonical `trades.exit_reason` values. Used verbatim; user-visible.
pub mod exit_reason {
    pub const EROSION_CAP_PROTECTED: &str = "erosion_cap_protected";
    pub const GREEN_TO_RED: &str = "green_to_red";
    pub const UNDERWATER_PROFITABLE_COLLAPSE: &str = "underwater_profitable_collapse";
    pub const UNDERWATER_SMALL_PEAK_TIMEOUT: &str = "underwater_small_peak_timeout";
    pub const UNDERWATER_NEVER_PROFITED: &str = "underwater_never_profited";
    pub const STALE_UNDERWATER: &str = "stale_underwater";
    pub const STALE_FLAT_TRADE: &str = "stale_flat_trade";
    pub const STOP_LOSS: &str = "stop_loss";
    pub const PROFIT_TARGET: &str = "profit_target";
    pub const EMERGENCY_STOP: &str = "emergency_stop";
    pub const MOMENTUM_FAILURE_EARLY: &str = "momentum_failure_early";
    pub const MOMENTUM_FAILURE_LATE: &str = "momentum_failure_late";

    /// Time-based exit tag (`time_exit_48_hours`).
    pub fn time_exit(hours: u32) -> String {
        format!("time_exit_{hours}_hours")
    }

    /// Exit reasons that protect profit; the close path re-verifies the trade
    /// is still green before honouring them.
    pub fn is_profit_protection(reason: &str) -> bool {
        reason == EROSION_CAP_PROTECTED
    }
}
