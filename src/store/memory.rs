// =============================================================================
// In-memory store — test double and paper-only deployments
// =============================================================================
//
// Implements the same contracts as the Postgres store, including idempotent
// inserts and the close-path serialisation semantics, against plain vectors
// behind one lock.
// =============================================================================

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use crate::types::{
    BotInstance, BotStatus, PyramidLevel, PyramidStatus, Regime, SubscriptionStatus, Trade,
    TradeStatus,
};

use super::{
    close_precheck, BotStore, CloseOutcome, CloseRequest, InsertOutcome, NewTrade, TradeStore,
};

#[derive(Default)]
struct Inner {
    trades: Vec<Trade>,
    bots: Vec<BotInstance>,
    subscriptions: HashMap<i64, SubscriptionStatus>,
    regimes: Vec<(String, Regime)>,
    peaks: HashMap<i64, f64>,
    next_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                ..Inner::default()
            }),
        }
    }

    // --- Seeding helpers (tests and paper bootstrap) -----------------------

    pub fn seed_bot(&self, bot: BotInstance, subscription: SubscriptionStatus) {
        let mut inner = self.inner.lock();
        inner.subscriptions.insert(bot.user_id, subscription);
        inner.bots.push(bot);
    }

    pub fn set_subscription(&self, user_id: i64, status: SubscriptionStatus) {
        self.inner.lock().subscriptions.insert(user_id, status);
    }

    pub fn trade_by_id(&self, trade_id: i64) -> Option<Trade> {
        self.inner
            .lock()
            .trades
            .iter()
            .find(|t| t.id == trade_id)
            .cloned()
    }

    pub fn bot_by_id(&self, bot_id: i64) -> Option<BotInstance> {
        self.inner.lock().bots.iter().find(|b| b.id == bot_id).cloned()
    }

    pub fn recorded_peak(&self, trade_id: i64) -> Option<f64> {
        self.inner.lock().peaks.get(&trade_id).copied()
    }

    pub fn regime_rows(&self) -> usize {
        self.inner.lock().regimes.len()
    }
}

#[async_trait]
impl TradeStore for MemoryStore {
    async fn insert_trade(&self, trade: &NewTrade) -> Result<InsertOutcome> {
        let mut inner = self.inner.lock();

        // UNIQUE(idempotency_key): duplicates silently no-op.
        if inner
            .trades
            .iter()
            .any(|t| t.idempotency_key == trade.idempotency_key)
        {
            return Ok(InsertOutcome::Duplicate);
        }

        let id = inner.next_id;
        inner.next_id += 1;

        inner.trades.push(Trade {
            id,
            bot_instance_id: trade.bot_instance_id,
            pair: trade.pair.clone(),
            side: trade.side,
            entry_price: trade.entry_price,
            quantity: trade.quantity,
            entry_time: trade.entry_time,
            stop_loss: trade.stop_loss,
            take_profit: trade.take_profit,
            fee: trade.fee,
            pyramid_levels: Vec::new(),
            status: TradeStatus::Open,
            exit_price: None,
            exit_time: None,
            profit_loss: None,
            profit_loss_percent: None,
            exit_reason: None,
            idempotency_key: trade.idempotency_key.clone(),
            trading_mode: trade.trading_mode,
        });

        Ok(InsertOutcome::Inserted(id))
    }

    async fn find_open(&self, bot_id: i64, pair: &str) -> Result<Option<Trade>> {
        Ok(self
            .inner
            .lock()
            .trades
            .iter()
            .find(|t| {
                t.bot_instance_id == bot_id && t.pair == pair && t.status == TradeStatus::Open
            })
            .cloned())
    }

    async fn open_trades(&self) -> Result<Vec<Trade>> {
        Ok(self
            .inner
            .lock()
            .trades
            .iter()
            .filter(|t| t.status == TradeStatus::Open)
            .cloned()
            .collect())
    }

    async fn open_trades_for_pair(&self, pair: &str) -> Result<Vec<Trade>> {
        Ok(self
            .inner
            .lock()
            .trades
            .iter()
            .filter(|t| t.status == TradeStatus::Open && t.pair == pair)
            .cloned()
            .collect())
    }

    async fn close_trade(&self, req: &CloseRequest) -> Result<CloseOutcome> {
        if let Some(outcome) = close_precheck(req) {
            return Ok(outcome);
        }

        let mut inner = self.inner.lock();
        let Some(trade) = inner.trades.iter_mut().find(|t| t.id == req.trade_id) else {
            warn!(trade_id = req.trade_id, "close requested for unknown trade");
            return Ok(CloseOutcome::AlreadyClosed);
        };

        if trade.status == TradeStatus::Closed {
            return Ok(CloseOutcome::AlreadyClosed);
        }

        trade.status = TradeStatus::Closed;
        trade.exit_price = Some(req.exit_price);
        trade.exit_time = Some(req.exit_time);
        trade.profit_loss = Some(req.profit_loss);
        trade.profit_loss_percent = Some(req.profit_loss_percent);
        trade.exit_reason = Some(req.exit_reason.clone());
        Ok(CloseOutcome::Closed)
    }

    async fn recent_closed(&self, bot_id: i64, limit: i64) -> Result<Vec<Trade>> {
        let inner = self.inner.lock();
        let mut closed: Vec<Trade> = inner
            .trades
            .iter()
            .filter(|t| t.bot_instance_id == bot_id && t.status == TradeStatus::Closed)
            .cloned()
            .collect();
        closed.sort_by_key(|t| std::cmp::Reverse(t.exit_time));
        closed.truncate(limit.max(0) as usize);
        Ok(closed)
    }

    async fn add_pyramid_level(&self, trade_id: i64, level: &PyramidLevel) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(trade) = inner.trades.iter_mut().find(|t| t.id == trade_id) {
            trade.pyramid_levels.push(level.clone());
        }
        Ok(())
    }

    async fn set_pyramid_status(
        &self,
        trade_id: i64,
        level: u8,
        status: PyramidStatus,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(trade) = inner.trades.iter_mut().find(|t| t.id == trade_id) {
            if let Some(pl) = trade.pyramid_levels.iter_mut().find(|pl| pl.level == level) {
                pl.status = status;
            }
        }
        Ok(())
    }

    async fn record_peak(&self, trade_id: i64, peak_pct: f64) -> Result<()> {
        self.inner.lock().peaks.insert(trade_id, peak_pct);
        Ok(())
    }

    async fn insert_regime(&self, pair: &str, regime: &Regime) -> Result<()> {
        self.inner
            .lock()
            .regimes
            .push((pair.to_string(), regime.clone()));
        Ok(())
    }
}

#[async_trait]
impl BotStore for MemoryStore {
    async fn running_bots(&self) -> Result<Vec<BotInstance>> {
        Ok(self
            .inner
            .lock()
            .bots
            .iter()
            .filter(|b| b.status == BotStatus::Running)
            .cloned()
            .collect())
    }

    async fn subscription_status(&self, user_id: i64) -> Result<SubscriptionStatus> {
        Ok(self
            .inner
            .lock()
            .subscriptions
            .get(&user_id)
            .copied()
            .unwrap_or(SubscriptionStatus::None))
    }

    async fn pause_bot(&self, bot_id: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(bot) = inner.bots.iter_mut().find(|b| b.id == bot_id) {
            bot.status = BotStatus::Paused;
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{exit_reason, idempotency_key, BotConfig, Side, TradingMode};
    use chrono::Utc;

    fn new_trade(bot_id: i64, key: &str) -> NewTrade {
        NewTrade {
            bot_instance_id: bot_id,
            pair: "BTC/USD".into(),
            side: Side::Buy,
            entry_price: 100_000.0,
            quantity: 0.01,
            entry_time: Utc::now(),
            stop_loss: 95_000.0,
            take_profit: 110_000.0,
            fee: 0.26,
            idempotency_key: key.into(),
            trading_mode: TradingMode::Paper,
        }
    }

    #[tokio::test]
    async fn duplicate_key_is_swallowed() {
        // S3: identical decisions within one second collapse onto one row.
        let store = MemoryStore::new();
        let ts = Utc::now();
        let key = idempotency_key(1, "BTC/USD", Side::Buy, ts);

        let first = store.insert_trade(&new_trade(1, &key)).await.unwrap();
        let second = store.insert_trade(&new_trade(1, &key)).await.unwrap();

        assert!(matches!(first, InsertOutcome::Inserted(_)));
        assert_eq!(second, InsertOutcome::Duplicate);
        assert_eq!(store.open_trades().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn at_most_one_open_trade_visible_per_bot_pair() {
        let store = MemoryStore::new();
        store.insert_trade(&new_trade(1, "k1")).await.unwrap();
        let open = store.find_open(1, "BTC/USD").await.unwrap();
        assert!(open.is_some());
        assert!(store.find_open(1, "ETH/USD").await.unwrap().is_none());
        assert!(store.find_open(2, "BTC/USD").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn double_close_returns_sentinel() {
        let store = MemoryStore::new();
        let InsertOutcome::Inserted(id) = store.insert_trade(&new_trade(1, "k1")).await.unwrap()
        else {
            panic!("insert failed");
        };

        let req = CloseRequest {
            bot_instance_id: 1,
            trade_id: id,
            pair: "BTC/USD".into(),
            exit_time: Utc::now(),
            exit_price: 101_000.0,
            profit_loss: 10.0,
            profit_loss_percent: 1.0,
            exit_reason: exit_reason::PROFIT_TARGET.into(),
            user_id: None,
        };

        assert_eq!(store.close_trade(&req).await.unwrap(), CloseOutcome::Closed);
        assert_eq!(
            store.close_trade(&req).await.unwrap(),
            CloseOutcome::AlreadyClosed
        );
    }

    #[tokio::test]
    async fn red_trade_rejects_profit_protection_close() {
        let store = MemoryStore::new();
        let InsertOutcome::Inserted(id) = store.insert_trade(&new_trade(1, "k1")).await.unwrap()
        else {
            panic!("insert failed");
        };

        let req = CloseRequest {
            bot_instance_id: 1,
            trade_id: id,
            pair: "BTC/USD".into(),
            exit_time: Utc::now(),
            exit_price: 99_000.0,
            profit_loss: -10.0,
            profit_loss_percent: -1.0,
            exit_reason: exit_reason::EROSION_CAP_PROTECTED.into(),
            user_id: None,
        };

        assert_eq!(
            store.close_trade(&req).await.unwrap(),
            CloseOutcome::ProfitProtectionInvalidForRedTrade
        );
        // Trade remains open for the next tick.
        assert!(store.find_open(1, "BTC/USD").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn running_bots_excludes_paused() {
        let store = MemoryStore::new();
        store.seed_bot(
            BotInstance {
                id: 1,
                user_id: 10,
                exchange: "binance".into(),
                enabled_pairs: vec!["BTC/USD".into()],
                status: BotStatus::Running,
                trading_mode: TradingMode::Paper,
                config: BotConfig::default(),
            },
            SubscriptionStatus::Active,
        );
        store.seed_bot(
            BotInstance {
                id: 2,
                user_id: 11,
                exchange: "binance".into(),
                enabled_pairs: vec!["BTC/USD".into()],
                status: BotStatus::Paused,
                trading_mode: TradingMode::Paper,
                config: BotConfig::default(),
            },
            SubscriptionStatus::Active,
        );

        let bots = store.running_bots().await.unwrap();
        assert_eq!(bots.len(), 1);
        assert_eq!(bots[0].id, 1);

        store.pause_bot(1).await.unwrap();
        assert!(store.running_bots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recent_closed_is_newest_first_and_limited() {
        let store = MemoryStore::new();
        for i in 0..5 {
            let InsertOutcome::Inserted(id) = store
                .insert_trade(&new_trade(1, &format!("k{i}")))
                .await
                .unwrap()
            else {
                panic!("insert failed");
            };
            store
                .close_trade(&CloseRequest {
                    bot_instance_id: 1,
                    trade_id: id,
                    pair: "BTC/USD".into(),
                    exit_time: Utc::now() + chrono::Duration::seconds(i),
                    exit_price: 100.0,
                    profit_loss: i as f64,
                    profit_loss_percent: i as f64 / 10.0,
                    exit_reason: exit_reason::PROFIT_TARGET.into(),
                    user_id: None,
                })
                .await
                .unwrap();
        }

        let recent = store.recent_closed(1, 3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].profit_loss, Some(4.0));
    }
}
