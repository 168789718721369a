// =============================================================================
// Stores — persistence capability contracts
// =============================================================================
//
// The database is the single source of truth for trades, bots, and pyramid
// state. The engine consumes it through the `TradeStore` and `BotStore`
// traits; `postgres` is the production implementation, `memory` backs tests
// and paper-only single-node runs.
// =============================================================================

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{
    exit_reason, BotInstance, PyramidLevel, PyramidStatus, Regime, Side, SubscriptionStatus,
    Trade, TradingMode,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---------------------------------------------------------------------------
// Insert / close contracts
// ---------------------------------------------------------------------------

/// A trade about to be persisted by the execution path.
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub bot_instance_id: i64,
    pub pair: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub fee: f64,
    pub idempotency_key: String,
    pub trading_mode: TradingMode,
}

/// Result of an idempotent insert. A duplicate key silently no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    Duplicate,
}

/// Close request accepted by the close path.
#[derive(Debug, Clone)]
pub struct CloseRequest {
    pub bot_instance_id: i64,
    pub trade_id: i64,
    pub pair: String,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub profit_loss: f64,
    pub profit_loss_percent: f64,
    pub exit_reason: String,
    pub user_id: Option<i64>,
}

/// Outcome of a close attempt. The close path is the serialisation point for
/// competing exit passes: a second attempt on the same trade gets
/// `AlreadyClosed` and leaves its position-tracker entry alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    AlreadyClosed,
    /// A profit-protection exit arrived for a trade that is no longer green.
    /// The trade stays open; the next tick re-evaluates.
    ProfitProtectionInvalidForRedTrade,
}

impl CloseOutcome {
    pub fn reason_label(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::AlreadyClosed => "already_closed",
            Self::ProfitProtectionInvalidForRedTrade => "profit_protection_invalid_for_red_trade",
        }
    }
}

/// Shared green-check used by both implementations: profit-protection exits
/// only close trades that are still green.
pub(crate) fn close_precheck(req: &CloseRequest) -> Option<CloseOutcome> {
    if exit_reason::is_profit_protection(&req.exit_reason) && req.profit_loss_percent <= 0.0 {
        return Some(CloseOutcome::ProfitProtectionInvalidForRedTrade);
    }
    None
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Idempotent insert keyed on `idempotency_key` (ON CONFLICT DO NOTHING).
    async fn insert_trade(&self, trade: &NewTrade) -> Result<InsertOutcome>;

    /// The open trade for `(bot, pair)`, if any. A bot has at most one.
    async fn find_open(&self, bot_id: i64, pair: &str) -> Result<Option<Trade>>;

    async fn open_trades(&self) -> Result<Vec<Trade>>;

    async fn open_trades_for_pair(&self, pair: &str) -> Result<Vec<Trade>>;

    /// Close a trade per the trade-close contract.
    async fn close_trade(&self, req: &CloseRequest) -> Result<CloseOutcome>;

    /// Most recent closed trades for a bot, newest first. Used for Kelly
    /// calibration.
    async fn recent_closed(&self, bot_id: i64, limit: i64) -> Result<Vec<Trade>>;

    async fn add_pyramid_level(&self, trade_id: i64, level: &PyramidLevel) -> Result<()>;

    async fn set_pyramid_status(
        &self,
        trade_id: i64,
        level: u8,
        status: PyramidStatus,
    ) -> Result<()>;

    /// Mirror the in-memory peak to the store (batched by the tracker).
    async fn record_peak(&self, trade_id: i64, peak_pct: f64) -> Result<()>;

    /// Persist one regime classification row.
    async fn insert_regime(&self, pair: &str, regime: &Regime) -> Result<()>;
}

#[async_trait]
pub trait BotStore: Send + Sync {
    /// Every bot with `status = running`, regardless of subscription state.
    /// The orchestrator pairs this with `subscription_status` and auto-pauses
    /// invalid owners.
    async fn running_bots(&self) -> Result<Vec<BotInstance>>;

    async fn subscription_status(&self, user_id: i64) -> Result<SubscriptionStatus>;

    async fn pause_bot(&self, bot_id: i64) -> Result<()>;
}
