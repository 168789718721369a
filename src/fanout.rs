// =============================================================================
// Execution Fan-Out — one decision, many bots
// =============================================================================
//
// `fan_out_trade_decision` converts one market-wide decision into per-bot
// execution plans: eligibility (running + valid subscription + pair
// enabled), the open-position guard, effective-balance resolution, Kelly
// sizing, and the regime / capital-preservation multipliers.
//
// `execute_trades_direct` then executes the plans synchronously, one at a
// time: re-check the open-position guard, override a stale signal price when
// the live ticker has drifted more than 0.1 %, place the order for live
// bots, and persist with the deterministic idempotency key (duplicate keys
// silently no-op). The direct path exists specifically to eliminate the
// race window the old async job-queue path had.
//
// The close path lives here too so every exit — fast loop, main loop, or
// worker — funnels through the same accounting.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::exchange::{ExchangeAdapter, OrderRequest};
use crate::sizer::{
    capital_preservation_multiplier, current_loss_streak, drawdown_pct, regime_multiplier,
    DynamicPositionSizer,
};
use crate::store::{BotStore, CloseOutcome, CloseRequest, InsertOutcome, NewTrade, TradeStore};
use crate::types::{
    idempotency_key, split_pair, BotInstance, ExecutionPlan, Trade, TradeDecision, TradingMode,
};

/// Ticker drift beyond which the live price overrides the signal price.
const PRICE_DRIFT_OVERRIDE: f64 = 0.001;

/// Safety buffer applied to exchange balances for unlimited-capital bots.
const BALANCE_BUFFER: f64 = 0.95;

/// Quote assets treated as interchangeable at 1:1 when summing balances.
const QUOTE_EQUIVALENTS: &[(&str, &[&str])] = &[
    ("USD", &["USD", "USDT", "USDC"]),
    ("USDT", &["USDT", "USD", "USDC"]),
];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionReport {
    pub executed: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct ExecutionFanOut {
    trade_store: Arc<dyn TradeStore>,
    bot_store: Arc<dyn BotStore>,
    /// Adapter per exchange name.
    adapters: HashMap<String, Arc<dyn ExchangeAdapter>>,
    default_stop_loss_pct: f64,
    taker_fee_pct: f64,
    reference_trending_down: Box<dyn Fn() -> bool + Send + Sync>,
}

impl ExecutionFanOut {
    pub fn new(
        trade_store: Arc<dyn TradeStore>,
        bot_store: Arc<dyn BotStore>,
        adapters: HashMap<String, Arc<dyn ExchangeAdapter>>,
        default_stop_loss_pct: f64,
        taker_fee_pct: f64,
        reference_trending_down: Box<dyn Fn() -> bool + Send + Sync>,
    ) -> Self {
        Self {
            trade_store,
            bot_store,
            adapters,
            default_stop_loss_pct,
            taker_fee_pct,
            reference_trending_down,
        }
    }

    fn adapter_for(&self, exchange: &str) -> Option<&Arc<dyn ExchangeAdapter>> {
        self.adapters.get(exchange)
    }

    // -------------------------------------------------------------------------
    // Fan-out
    // -------------------------------------------------------------------------

    /// Convert one decision into per-bot execution plans.
    pub async fn fan_out_trade_decision(
        &self,
        decision: &TradeDecision,
        blocked_pairs: &HashSet<String>,
    ) -> Vec<ExecutionPlan> {
        if blocked_pairs.contains(&decision.pair) {
            debug!(pair = %decision.pair, "pair is regime-blocked — no fan-out");
            return Vec::new();
        }

        let bots = match self.bot_store.running_bots().await {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "bot load failed — skipping fan-out");
                return Vec::new();
            }
        };

        let mut plans = Vec::new();
        for bot in bots {
            if !bot.enabled_pairs.iter().any(|p| p == &decision.pair) {
                continue;
            }

            match self.bot_store.subscription_status(bot.user_id).await {
                Ok(status) if status.is_valid() => {}
                Ok(_) | Err(_) => continue,
            }

            match self.plan_for_bot(&bot, decision).await {
                Ok(Some(plan)) => plans.push(plan),
                Ok(None) => {}
                Err(e) => {
                    // Bot-scoped failure (bad keys, balance fetch): skip this
                    // plan only, never the cycle.
                    error!(bot_id = bot.id, error = %e, "fan-out plan failed for bot");
                }
            }
        }

        info!(
            pair = %decision.pair,
            plans = plans.len(),
            confidence = decision.confidence,
            "decision fanned out"
        );
        plans
    }

    async fn plan_for_bot(
        &self,
        bot: &BotInstance,
        decision: &TradeDecision,
    ) -> Result<Option<ExecutionPlan>> {
        // One open trade per (bot, pair).
        if self
            .trade_store
            .find_open(bot.id, &decision.pair)
            .await?
            .is_some()
        {
            debug!(bot_id = bot.id, pair = %decision.pair, "open position exists — skipping");
            return Ok(None);
        }

        let balance = self.effective_balance(bot, &decision.pair).await?;
        if balance <= 0.0 {
            debug!(bot_id = bot.id, "no effective balance — skipping");
            return Ok(None);
        }

        let mut sizer = DynamicPositionSizer::new(balance);
        let history = self.trade_store.recent_closed(bot.id, 100).await?;
        sizer.calibrate(&history);

        let stop_loss_pct = {
            let raw = (decision.stop_loss - decision.entry_price).abs() / decision.entry_price;
            if raw.is_finite() && raw > 0.0001 {
                raw
            } else {
                self.default_stop_loss_pct
            }
        };

        let base = sizer.base_quantity(decision.confidence, decision.entry_price, stop_loss_pct);
        let regime_mult = regime_multiplier(decision.regime, decision.is_transitioning);
        let preservation = capital_preservation_multiplier(
            (self.reference_trending_down)(),
            drawdown_pct(&history),
            current_loss_streak(&history),
        );

        let quantity = base * regime_mult * preservation;
        if !quantity.is_finite() || quantity <= 0.0 {
            debug!(bot_id = bot.id, quantity, "non-positive quantity — dropping plan");
            return Ok(None);
        }

        Ok(Some(ExecutionPlan {
            bot_id: bot.id,
            user_id: bot.user_id,
            exchange: bot.exchange.clone(),
            pair: decision.pair.clone(),
            side: decision.side,
            quantity,
            price: decision.entry_price,
            stop_loss: decision.stop_loss,
            take_profit: decision.take_profit,
            trading_mode: bot.trading_mode,
            ai_confidence: decision.confidence,
            idempotency_key: idempotency_key(
                bot.id,
                &decision.pair,
                decision.side,
                decision.decided_at,
            ),
        }))
    }

    /// Fixed capital when configured, otherwise the exchange balance summed
    /// over quote-equivalent assets with a 5 % safety buffer.
    async fn effective_balance(&self, bot: &BotInstance, pair: &str) -> Result<f64> {
        if bot.config.initial_capital > 0.0 {
            return Ok(bot.config.initial_capital);
        }

        let adapter = self
            .adapter_for(&bot.exchange)
            .with_context(|| format!("no adapter for exchange {:?}", bot.exchange))?;

        let quote = split_pair(pair).map(|(_, q)| q).unwrap_or("USD");
        let equivalents: &[&str] = QUOTE_EQUIVALENTS
            .iter()
            .find(|(q, _)| *q == quote)
            .map(|(_, eq)| *eq)
            .unwrap_or(&[]);

        let balances = adapter.get_balances().await?;
        let total: f64 = balances
            .iter()
            .filter(|b| b.asset == quote || equivalents.contains(&b.asset.as_str()))
            .map(|b| b.total)
            .sum();

        Ok(total * BALANCE_BUFFER)
    }

    // -------------------------------------------------------------------------
    // Direct execution
    // -------------------------------------------------------------------------

    /// Execute plans synchronously, one at a time.
    pub async fn execute_trades_direct(&self, plans: &[ExecutionPlan]) -> ExecutionReport {
        let mut report = ExecutionReport::default();

        for plan in plans {
            match self.execute_plan(plan).await {
                Ok(true) => report.executed += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(bot_id = plan.bot_id, pair = %plan.pair, error = %e, "execution failed");
                }
            }
        }

        info!(
            executed = report.executed,
            skipped = report.skipped,
            failed = report.failed,
            "direct execution finished"
        );
        report
    }

    async fn execute_plan(&self, plan: &ExecutionPlan) -> Result<bool> {
        // Re-check the open-position guard right before acting.
        if self
            .trade_store
            .find_open(plan.bot_id, &plan.pair)
            .await?
            .is_some()
        {
            debug!(bot_id = plan.bot_id, pair = %plan.pair, "open position appeared — skipping");
            return Ok(false);
        }

        // Override a stale signal price when the live ticker drifted.
        let mut price = plan.price;
        if let Some(adapter) = self.adapter_for(&plan.exchange) {
            if let Ok(ticker) = adapter.get_ticker(&plan.pair).await {
                let drift = (ticker.price - plan.price).abs() / plan.price;
                if drift > PRICE_DRIFT_OVERRIDE {
                    debug!(
                        pair = %plan.pair,
                        signal_price = plan.price,
                        live_price = ticker.price,
                        "price drift — using live price"
                    );
                    price = ticker.price;
                }
            }
        }

        // Live bots hit the exchange; paper bots get a synthetic fill.
        let (fill_price, fee) = match plan.trading_mode {
            TradingMode::Live => {
                let adapter = self
                    .adapter_for(&plan.exchange)
                    .with_context(|| format!("no adapter for exchange {:?}", plan.exchange))?;
                let fill = adapter
                    .place_order(&OrderRequest {
                        pair: plan.pair.clone(),
                        side: plan.side,
                        amount: plan.quantity,
                        price: None,
                    })
                    .await
                    .context("order placement failed")?;
                let price = if fill.avg_price > 0.0 { fill.avg_price } else { price };
                (price, fill.fee)
            }
            TradingMode::Paper => {
                let fee = price * plan.quantity * self.taker_fee_pct / 100.0;
                (price, fee)
            }
        };

        let outcome = self
            .trade_store
            .insert_trade(&NewTrade {
                bot_instance_id: plan.bot_id,
                pair: plan.pair.clone(),
                side: plan.side,
                entry_price: fill_price,
                quantity: plan.quantity,
                entry_time: Utc::now(),
                stop_loss: plan.stop_loss,
                take_profit: plan.take_profit,
                fee,
                idempotency_key: plan.idempotency_key.clone(),
                trading_mode: plan.trading_mode,
            })
            .await?;

        match outcome {
            InsertOutcome::Inserted(id) => {
                info!(
                    trade_id = id,
                    bot_id = plan.bot_id,
                    pair = %plan.pair,
                    price = fill_price,
                    quantity = plan.quantity,
                    mode = %plan.trading_mode,
                    "trade opened"
                );
                Ok(true)
            }
            InsertOutcome::Duplicate => {
                debug!(key = %plan.idempotency_key, "duplicate execution swallowed");
                Ok(false)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Pyramid adds
    // -------------------------------------------------------------------------

    /// Persist and execute one pyramid add-on. The level is recorded as
    /// pending first so a crash between persist and fill leaves an audit
    /// trail, then marked filled or failed.
    pub async fn execute_pyramid_add(
        &self,
        trade: &Trade,
        exchange: &str,
        level: &crate::types::PyramidLevel,
    ) -> Result<crate::types::PyramidStatus> {
        use crate::types::PyramidStatus;

        self.trade_store.add_pyramid_level(trade.id, level).await?;

        let status = match trade.trading_mode {
            TradingMode::Live => {
                let adapter = self
                    .adapter_for(exchange)
                    .with_context(|| format!("no adapter for exchange {exchange:?}"))?;
                match adapter
                    .place_order(&OrderRequest {
                        pair: trade.pair.clone(),
                        side: trade.side,
                        amount: level.quantity,
                        price: None,
                    })
                    .await
                {
                    Ok(_) => PyramidStatus::Filled,
                    Err(e) => {
                        error!(trade_id = trade.id, level = level.level, error = %e, "pyramid order failed");
                        PyramidStatus::Failed
                    }
                }
            }
            TradingMode::Paper => PyramidStatus::Filled,
        };

        self.trade_store
            .set_pyramid_status(trade.id, level.level, status)
            .await?;

        info!(
            trade_id = trade.id,
            level = level.level,
            quantity = level.quantity,
            status = ?status,
            "pyramid level executed"
        );
        Ok(status)
    }

    // -------------------------------------------------------------------------
    // Close path
    // -------------------------------------------------------------------------

    /// Close one trade. The database update is the serialisation point; the
    /// live sell order only goes out after this instance won the close.
    pub async fn close_position(
        &self,
        trade: &Trade,
        exit_price: f64,
        exit_reason: &str,
    ) -> Result<CloseOutcome> {
        let gross_pct = trade.gross_profit_pct(exit_price);
        let entry_fee_pct = if trade.entry_price > 0.0 && trade.quantity > 0.0 {
            trade.fee / (trade.entry_price * trade.quantity) * 100.0
        } else {
            0.0
        };
        let net_pct = gross_pct - entry_fee_pct - self.taker_fee_pct;

        let exit_fee = exit_price * trade.quantity * self.taker_fee_pct / 100.0;
        let profit_loss =
            (exit_price - trade.entry_price) * trade.quantity - trade.fee - exit_fee;

        let outcome = self
            .trade_store
            .close_trade(&CloseRequest {
                bot_instance_id: trade.bot_instance_id,
                trade_id: trade.id,
                pair: trade.pair.clone(),
                exit_time: Utc::now(),
                exit_price,
                profit_loss,
                profit_loss_percent: net_pct,
                exit_reason: exit_reason.to_string(),
                user_id: None,
            })
            .await?;

        match outcome {
            CloseOutcome::Closed => {
                info!(
                    trade_id = trade.id,
                    pair = %trade.pair,
                    exit_price,
                    profit_loss = format!("{profit_loss:.2}"),
                    net_pct = format!("{net_pct:.3}"),
                    reason = exit_reason,
                    "trade closed"
                );

                if trade.trading_mode == TradingMode::Live {
                    if let Some(adapter) = self.adapter_for(&self.exchange_of(trade).await) {
                        if let Err(e) = adapter
                            .place_order(&OrderRequest {
                                pair: trade.pair.clone(),
                                side: crate::types::Side::Sell,
                                amount: trade.quantity,
                                price: None,
                            })
                            .await
                        {
                            // The row is closed but the exchange sell failed;
                            // reconciliation has to pick this up.
                            error!(trade_id = trade.id, error = %e, "live exit order failed");
                        }
                    }
                }
            }
            CloseOutcome::AlreadyClosed => {
                debug!(trade_id = trade.id, "close lost the race — leaving tracker untouched");
            }
            CloseOutcome::ProfitProtectionInvalidForRedTrade => {
                warn!(
                    trade_id = trade.id,
                    reason = exit_reason,
                    "profit-protection close rejected for red trade"
                );
            }
        }

        Ok(outcome)
    }

    async fn exchange_of(&self, trade: &Trade) -> String {
        // Single-adapter deployments skip the lookup.
        if self.adapters.len() == 1 {
            return self.adapters.keys().next().cloned().unwrap_or_default();
        }
        match self.bot_store.running_bots().await {
            Ok(bots) => bots
                .iter()
                .find(|b| b.id == trade.bot_instance_id)
                .map(|b| b.exchange.clone())
                .unwrap_or_default(),
            Err(_) => String::new(),
        }
    }
}
