// =============================================================================
// Orchestrator — periodic trade-decision and position-lifecycle driver
// =============================================================================
//
// Two independent tickers:
//
//   Main tick (default 30 s): reload bots (auto-pausing invalid
//   subscriptions), refresh the reference-pair momentum, detect regimes for
//   every pair, run the exit passes (momentum failure and profit/underwater
//   concurrently), run the pyramid pass, then the entry pass. Ordering
//   inside one cycle is strict: regimes before entries, exits before
//   pyramids, pyramids before entries.
//
//   Peak tick (default 1 s): compute NET profit for every open trade, raise
//   peaks monotonically, and evaluate the erosion cap for trades that are
//   currently profitable. The fast loop never exits on green-to-red alone —
//   underwater decisions belong to the main loop's time-and-regime table.
//
// The orchestrator also owns the per-pair loss-cooldown and loss-streak
// maps: base cooldown 5 minutes scaled by min(streak, 3); a streak at the
// cap sidelines the pair for hours. A winning trade clears both.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::fanout::ExecutionFanOut;
use crate::indicators;
use crate::market_data::{MarketDataAggregator, OhlcCache};
use crate::momentum::MomentumFailureDetector;
use crate::pubsub::PubSubBus;
use crate::regime::RegimeDetector;
use crate::risk::{EntryContext, EntryVerdict, RiskManager};
use crate::signal::{SignalAction, SignalRequest, SignalSource};
use crate::store::{BotStore, CloseOutcome, TradeStore};
use crate::tracker::{underwater_threshold_pct, PositionTracker};
use crate::types::{
    exit_reason, BotInstance, IndicatorSnapshot, MarketData, PyramidLevel, PyramidStatus, Regime,
    RegimeKind, Side, Trade, TradeDecision,
};

/// Channel carrying owner notifications (auto-pause and similar events).
const NOTIFICATIONS_CHANNEL: &str = "bot_notifications";

/// Peak ticks between flushes of pending peak updates.
const FLUSH_EVERY_TICKS: u64 = 10;

/// One rejection row for the per-cycle audit summary.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub pair: String,
    pub stage: &'static str,
    pub reason: String,
}

pub struct Orchestrator {
    cfg: EngineConfig,
    trade_store: Arc<dyn TradeStore>,
    bot_store: Arc<dyn BotStore>,
    aggregator: Arc<MarketDataAggregator>,
    ohlc: Arc<OhlcCache>,
    regime: Arc<RegimeDetector>,
    risk: Arc<RiskManager>,
    tracker: Arc<PositionTracker>,
    momentum: Arc<MomentumFailureDetector>,
    fanout: Arc<ExecutionFanOut>,
    signals: Arc<dyn SignalSource>,
    bus: Arc<dyn PubSubBus>,
    /// Last cycle's regime per pair.
    regimes: RwLock<HashMap<String, Regime>>,
    /// pair → cooldown expiry (unix ms).
    cooldowns: RwLock<HashMap<String, i64>>,
    /// pair → consecutive losses.
    loss_streaks: RwLock<HashMap<String, u32>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: EngineConfig,
        trade_store: Arc<dyn TradeStore>,
        bot_store: Arc<dyn BotStore>,
        aggregator: Arc<MarketDataAggregator>,
        ohlc: Arc<OhlcCache>,
        regime: Arc<RegimeDetector>,
        risk: Arc<RiskManager>,
        tracker: Arc<PositionTracker>,
        momentum: Arc<MomentumFailureDetector>,
        fanout: Arc<ExecutionFanOut>,
        signals: Arc<dyn SignalSource>,
        bus: Arc<dyn PubSubBus>,
    ) -> Self {
        Self {
            cfg,
            trade_store,
            bot_store,
            aggregator,
            ohlc,
            regime,
            risk,
            tracker,
            momentum,
            fanout,
            signals,
            bus,
            regimes: RwLock::new(HashMap::new()),
            cooldowns: RwLock::new(HashMap::new()),
            loss_streaks: RwLock::new(HashMap::new()),
        }
    }

    // Accessors for the worker deployment path.

    pub fn aggregator(&self) -> &Arc<MarketDataAggregator> {
        &self.aggregator
    }

    pub fn trade_store(&self) -> &Arc<dyn TradeStore> {
        &self.trade_store
    }

    pub fn ohlc(&self) -> &Arc<OhlcCache> {
        &self.ohlc
    }

    pub fn fanout(&self) -> &Arc<ExecutionFanOut> {
        &self.fanout
    }

    // =========================================================================
    // Loops
    // =========================================================================

    /// Main tick loop. Runs until the shutdown signal flips.
    pub async fn run_main_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.cfg.main_tick_secs));
        info!(tick_secs = self.cfg.main_tick_secs, "orchestrator main loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_cycle().await,
                _ = shutdown.changed() => {
                    info!("orchestrator main loop stopping");
                    return;
                }
            }
        }
    }

    /// High-frequency peak-tracking loop.
    pub async fn run_peak_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.cfg.peak_tracking_interval_ms));
        let mut tick: u64 = 0;
        info!(
            interval_ms = self.cfg.peak_tracking_interval_ms,
            "peak tracking loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.peak_pass().await;
                    tick += 1;
                    if tick % FLUSH_EVERY_TICKS == 0 {
                        self.tracker.flush_pending_updates(&self.trade_store).await;
                    }
                }
                _ = shutdown.changed() => {
                    self.tracker.flush_pending_updates(&self.trade_store).await;
                    info!("peak tracking loop stopping");
                    return;
                }
            }
        }
    }

    /// One full main-tick cycle.
    pub async fn run_cycle(&self) {
        let bots = self.reload_bots().await;

        self.refresh_reference_momentum().await;

        let regimes = self.regime.detect_for_all_pairs(&self.cfg.pairs).await;
        *self.regimes.write() = regimes;

        // Exit passes may run concurrently; the close path serialises them.
        tokio::join!(self.momentum_failure_pass(), self.profit_exit_pass());

        self.pyramid_pass().await;

        let rejections = self.entry_pass(&bots).await;
        if !rejections.is_empty() {
            for r in &rejections {
                debug!(pair = %r.pair, stage = r.stage, reason = %r.reason, "entry rejected");
            }
            info!(rejections = rejections.len(), "entry pass rejections this cycle");
        }

        self.ohlc.evict_expired();
    }

    // =========================================================================
    // Bot reload / subscription enforcement
    // =========================================================================

    /// Reload running bots, auto-pausing any whose owner's subscription is
    /// no longer valid (S5). Their open trades stay exit-monitored — only
    /// new entries stop.
    pub async fn reload_bots(&self) -> Vec<BotInstance> {
        let bots = match self.bot_store.running_bots().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "bot reload failed — empty cycle");
                return Vec::new();
            }
        };

        let mut valid = Vec::new();
        for bot in bots {
            let status = self
                .bot_store
                .subscription_status(bot.user_id)
                .await
                .unwrap_or(crate::types::SubscriptionStatus::None);

            if status.is_valid() {
                valid.push(bot);
                continue;
            }

            warn!(
                bot_id = bot.id,
                user_id = bot.user_id,
                status = ?status,
                "subscription invalid — auto-pausing bot"
            );
            if let Err(e) = self.bot_store.pause_bot(bot.id).await {
                warn!(bot_id = bot.id, error = %e, "auto-pause failed");
            }

            let payload = serde_json::json!({
                "type": "bot_paused",
                "bot_id": bot.id,
                "user_id": bot.user_id,
                "reason": "subscription_invalid",
            })
            .to_string();
            if let Err(e) = self.bus.publish(NOTIFICATIONS_CHANNEL, &payload).await {
                debug!(error = %e, "owner notification publish failed");
            }
        }
        valid
    }

    async fn refresh_reference_momentum(&self) {
        match self.ohlc.fetch(&self.cfg.reference_pair, "1h", 30).await {
            Ok(candles) => {
                let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
                if let Some(momentum) = indicators::momentum_pct(&closes, 1) {
                    self.risk.set_reference_momentum(momentum);
                }
            }
            Err(e) => debug!(error = %e, "reference momentum fetch failed"),
        }
    }

    // =========================================================================
    // Exit passes
    // =========================================================================

    fn regime_for(&self, pair: &str) -> RegimeKind {
        self.regimes
            .read()
            .get(pair)
            .map(|r| r.kind)
            // Unknown regime is treated as chop: tightest erosion cap.
            .unwrap_or(RegimeKind::Choppy)
    }

    pub(crate) fn set_regime(&self, pair: &str, regime: Regime) {
        self.regimes.write().insert(pair.to_string(), regime);
    }

    fn net_profit_pct(&self, trade: &Trade, price: f64) -> f64 {
        let gross = trade.gross_profit_pct(price);
        let entry_fee_pct = if trade.entry_price > 0.0 && trade.quantity > 0.0 {
            trade.fee / (trade.entry_price * trade.quantity) * 100.0
        } else {
            0.0
        };
        gross - entry_fee_pct - self.cfg.taker_fee_pct
    }

    async fn close_and_clear(&self, trade: &Trade, price: f64, reason: &str) {
        match self.fanout.close_position(trade, price, reason).await {
            Ok(CloseOutcome::Closed) => {
                self.tracker.clear_position(trade.id);
                self.momentum.clear(trade.id);
                let net = self.net_profit_pct(trade, price);
                self.record_trade_outcome(&trade.pair, net);
            }
            // Lost the race or red-trade sentinel: leave the tracker alone;
            // the next tick retries.
            Ok(_) => {}
            Err(e) => warn!(trade_id = trade.id, error = %e, "close attempt failed"),
        }
    }

    /// Momentum-failure voting over every open trade.
    async fn momentum_failure_pass(&self) {
        let trades = match self.trade_store.open_trades().await {
            Ok(t) => t,
            Err(e) => {
                debug!(error = %e, "open-trade load failed in momentum pass");
                return;
            }
        };

        for trade in trades {
            let Some(market) = self.aggregator.cached(&trade.pair) else {
                continue;
            };

            let candles = match self.ohlc.fetch(&trade.pair, "1h", 100).await {
                Ok(c) => c,
                Err(_) => continue,
            };
            let Some(ind) = indicators::compute_snapshot(&candles) else {
                continue;
            };

            let now = Utc::now();
            let (age_minutes, clamped) = trade.age_minutes(now);
            if clamped {
                warn!(trade_id = trade.id, entry_time = %trade.entry_time, "future-dated entry time");
            }

            let verdict = self.momentum.evaluate(trade.id, age_minutes, &ind);
            if verdict.should_exit {
                let reason = verdict.reason.unwrap_or(exit_reason::MOMENTUM_FAILURE_LATE);
                self.close_and_clear(&trade, market.price, reason).await;
            }
        }
    }

    /// Profit-target, stop-loss, emergency, underwater, and staleness exits.
    async fn profit_exit_pass(&self) {
        let trades = match self.trade_store.open_trades().await {
            Ok(t) => t,
            Err(e) => {
                debug!(error = %e, "open-trade load failed in profit pass");
                return;
            }
        };

        for trade in trades {
            self.evaluate_exit_rules(&trade).await;
        }
    }

    /// The main-loop exit rules for one trade, in priority order.
    pub async fn evaluate_exit_rules(&self, trade: &Trade) {
        let Some(market) = self.aggregator.cached(&trade.pair) else {
            debug!(trade_id = trade.id, pair = %trade.pair, "no fresh price — skipping exit checks");
            return;
        };
        let price = market.price;

        if trade.entry_price <= 0.0 {
            warn!(trade_id = trade.id, entry_price = trade.entry_price, "invalid entry price — skipping");
            return;
        }

        let gross = trade.gross_profit_pct(price);
        let net = self.net_profit_pct(trade, price);
        let regime = self.regime_for(&trade.pair);
        let now = Utc::now();
        let (age_minutes, _) = trade.age_minutes(now);

        // 1. Emergency stop: catastrophic loss closes unconditionally.
        if gross <= self.cfg.emergency_stop_loss_pct {
            self.close_and_clear(trade, price, exit_reason::EMERGENCY_STOP)
                .await;
            return;
        }

        // 2. Stop loss.
        if trade.stop_loss > 0.0 && price <= trade.stop_loss {
            self.close_and_clear(trade, price, exit_reason::STOP_LOSS).await;
            return;
        }

        // 3. Profit target by regime.
        if net >= self.cfg.profit_targets.for_regime(regime) {
            self.close_and_clear(trade, price, exit_reason::PROFIT_TARGET)
                .await;
            return;
        }

        // 4. Underwater: time-and-regime threshold table.
        let threshold = underwater_threshold_pct(age_minutes, regime.is_trending());
        let verdict = self.tracker.check_underwater_exit(
            trade.id,
            &trade.pair,
            net,
            trade.entry_time,
            now,
            threshold,
            self.cfg.underwater_min_minutes,
        );
        if verdict.should_exit {
            let reason = verdict.reason.unwrap_or(exit_reason::UNDERWATER_NEVER_PROFITED);
            self.close_and_clear(trade, price, reason).await;
            return;
        }

        // 5. Staleness: losing trades past the stale window, flat trades
        //    past the time-exit window.
        if net < 0.0 && age_minutes >= self.cfg.stale_underwater_minutes {
            self.close_and_clear(trade, price, exit_reason::STALE_UNDERWATER)
                .await;
            return;
        }
        let time_exit_minutes = self.cfg.time_exit_hours as i64 * 60;
        if age_minutes >= time_exit_minutes {
            let reason = if net.abs() < 0.2 {
                exit_reason::STALE_FLAT_TRADE.to_string()
            } else {
                exit_reason::time_exit(self.cfg.time_exit_hours)
            };
            self.close_and_clear(trade, price, &reason).await;
        }
    }

    // =========================================================================
    // Peak pass (fast loop)
    // =========================================================================

    /// One pass of the high-frequency loop: raise peaks, evaluate the
    /// erosion cap on profitable trades.
    pub async fn peak_pass(&self) {
        let trades = match self.trade_store.open_trades().await {
            Ok(t) => t,
            Err(e) => {
                debug!(error = %e, "open-trade load failed in peak pass");
                return;
            }
        };

        for trade in trades {
            let Some(market) = self.aggregator.cached(&trade.pair) else {
                continue;
            };
            let price = market.price;

            // Untrackable trades are skipped, not inserted in degraded mode.
            if trade.entry_price <= 0.0 || trade.quantity <= 0.0 {
                warn!(
                    trade_id = trade.id,
                    entry_price = trade.entry_price,
                    "untrackable trade — skipping peak tracking"
                );
                continue;
            }

            let net = self.net_profit_pct(&trade, price);
            let exit_fee = price * trade.quantity * self.cfg.taker_fee_pct / 100.0;

            if !self.tracker.is_tracked(trade.id) {
                self.tracker.record_peak(
                    trade.id,
                    &trade.pair,
                    net.max(0.0),
                    trade.entry_time.timestamp_millis(),
                    trade.entry_price,
                    trade.quantity,
                    price,
                    trade.fee,
                );
            }

            self.tracker
                .update_peak_if_higher(trade.id, net, price, trade.fee + exit_fee);

            // The fast loop only acts on currently profitable trades; the
            // main loop owns underwater decisions.
            if net <= 0.0 {
                continue;
            }

            let regime = self.regime_for(&trade.pair);
            let verdict =
                self.tracker
                    .check_erosion_cap(trade.id, &trade.pair, net, regime, price);
            if verdict.should_exit {
                let reason = verdict.reason.unwrap_or(exit_reason::EROSION_CAP_PROTECTED);
                self.close_and_clear(&trade, price, reason).await;
            }
        }
    }

    // =========================================================================
    // Pyramid pass
    // =========================================================================

    /// Add to profitable positions at the configured milestones.
    async fn pyramid_pass(&self) {
        let trades = match self.trade_store.open_trades().await {
            Ok(t) => t,
            Err(e) => {
                debug!(error = %e, "open-trade load failed in pyramid pass");
                return;
            }
        };

        for trade in trades {
            let next_level = (trade.pyramid_levels.len() + 1) as u8;
            let Some(trigger) = self
                .cfg
                .pyramid_triggers
                .get(next_level as usize - 1)
                .copied()
            else {
                continue; // all levels filled
            };

            let Some(market) = self.aggregator.cached(&trade.pair) else {
                continue;
            };
            let net = self.net_profit_pct(&trade, market.price);
            if net < trigger {
                continue;
            }

            let candles = match self.ohlc.fetch(&trade.pair, "1h", 100).await {
                Ok(c) => c,
                Err(_) => continue,
            };
            let Some(ind) = indicators::compute_snapshot(&candles) else {
                continue;
            };
            if ind.adx < self.cfg.pyramid_min_adx {
                continue;
            }

            // Consult the signal source for fresh confidence.
            let request = SignalRequest {
                pair: trade.pair.clone(),
                timeframe: self.cfg.signal_timeframe.clone(),
                include_signal: true,
                include_regime: false,
                current_price: market.price,
                indicators: ind,
            };
            let confidence = match self.signals.analyze_market(&request).await {
                Ok(resp) if resp.signal == SignalAction::Buy => resp.confidence,
                Ok(_) => continue,
                Err(e) => {
                    debug!(pair = %trade.pair, error = %e, "pyramid signal consult failed");
                    continue;
                }
            };

            if !self.risk.can_add_pyramid_level(next_level, confidence) {
                debug!(
                    trade_id = trade.id,
                    level = next_level,
                    confidence,
                    "pyramid confidence gate not met"
                );
                continue;
            }

            // Half the original quantity per add.
            let level = PyramidLevel {
                level: next_level,
                entry_price: market.price,
                quantity: trade.quantity * 0.5,
                entry_time: Utc::now(),
                trigger_profit_pct: trigger,
                status: PyramidStatus::PendingExecution,
                ai_confidence: confidence,
            };

            let exchange = self.exchange_of_bot(trade.bot_instance_id).await;
            if let Err(e) = self
                .fanout
                .execute_pyramid_add(&trade, &exchange, &level)
                .await
            {
                warn!(trade_id = trade.id, error = %e, "pyramid add failed");
            }
        }
    }

    async fn exchange_of_bot(&self, bot_id: i64) -> String {
        match self.bot_store.running_bots().await {
            Ok(bots) => bots
                .iter()
                .find(|b| b.id == bot_id)
                .map(|b| b.exchange.clone())
                .unwrap_or_default(),
            Err(_) => String::new(),
        }
    }

    // =========================================================================
    // Entry pass
    // =========================================================================

    /// Entry evaluation for every configured pair. Returns the rejection
    /// summaries for the cycle audit.
    async fn entry_pass(&self, bots: &[BotInstance]) -> Vec<Rejection> {
        let mut rejections = Vec::new();

        for pair in self.cfg.pairs.clone() {
            if self.pair_on_cooldown(&pair) {
                debug!(pair = %pair, "pair on loss cooldown — skipping entry");
                continue;
            }

            // Skip the expensive path when no bot could act on the pair.
            let mut any_idle = false;
            for bot in bots.iter().filter(|b| b.enabled_pairs.contains(&pair)) {
                match self.trade_store.find_open(bot.id, &pair).await {
                    Ok(None) => {
                        any_idle = true;
                        break;
                    }
                    Ok(Some(_)) => {}
                    Err(e) => debug!(bot_id = bot.id, error = %e, "open check failed"),
                }
            }
            if !any_idle {
                continue;
            }

            let market = match self.aggregator.get_market_data(&[pair.clone()]).await.remove(&pair) {
                Some(m) => m,
                None => {
                    debug!(pair = %pair, "no market data — skipping entry");
                    continue;
                }
            };

            let candles = match self.ohlc.fetch(&pair, "1h", 100).await {
                Ok(c) => c,
                Err(e) => {
                    debug!(pair = %pair, error = %e, "candle fetch failed");
                    continue;
                }
            };
            let Some(ind) = indicators::compute_snapshot(&candles) else {
                warn!(pair = %pair, candles = candles.len(), "insufficient candles for entry");
                continue;
            };

            match self.evaluate_pair_entry(&pair, &market, &ind).await {
                Ok(Some(decision)) => {
                    let plans = self
                        .fanout
                        .fan_out_trade_decision(&decision, &HashSet::new())
                        .await;
                    if !plans.is_empty() {
                        self.fanout.execute_trades_direct(&plans).await;
                    }
                }
                Ok(None) => {}
                Err(rejection) => rejections.push(rejection),
            }
        }

        rejections
    }

    /// Stages 1–5 for one pair. `Ok(Some(decision))` means a buy decision is
    /// ready for fan-out; `Err` carries the audit rejection.
    pub async fn evaluate_pair_entry(
        &self,
        pair: &str,
        market: &MarketData,
        ind: &IndicatorSnapshot,
    ) -> Result<Option<TradeDecision>, Rejection> {
        let verdict = self.risk.evaluate_entry(&EntryContext {
            market,
            indicators: ind,
            prefilter_spread_pct: market.spread_pct(),
        });

        let is_transitioning = match verdict {
            EntryVerdict::Pass { is_transitioning } => is_transitioning,
            EntryVerdict::Reject { stage, reason } => {
                return Err(Rejection {
                    pair: pair.to_string(),
                    stage,
                    reason,
                })
            }
        };

        // Stage 5: consult the signal source.
        let request = SignalRequest {
            pair: pair.to_string(),
            timeframe: self.cfg.signal_timeframe.clone(),
            include_signal: true,
            include_regime: true,
            current_price: market.price,
            indicators: *ind,
        };
        let response = match self.signals.analyze_market(&request).await {
            Ok(r) => r,
            Err(e) => {
                return Err(Rejection {
                    pair: pair.to_string(),
                    stage: "ai_validation",
                    reason: format!("signal source error: {e}"),
                })
            }
        };

        if response.signal != SignalAction::Buy {
            return Ok(None);
        }

        if let EntryVerdict::Reject { stage, reason } =
            self.risk.validate_ai_confidence(response.confidence)
        {
            return Err(Rejection {
                pair: pair.to_string(),
                stage,
                reason,
            });
        }

        let regime = if is_transitioning {
            RegimeKind::Transitioning
        } else {
            self.regime_for(pair)
        };

        let entry_price = if response.entry_price > 0.0 {
            response.entry_price
        } else {
            market.price
        };
        let stop_loss = if response.stop_loss > 0.0 {
            response.stop_loss
        } else {
            entry_price * (1.0 - self.cfg.default_stop_loss_pct)
        };

        Ok(Some(TradeDecision {
            pair: pair.to_string(),
            side: Side::Buy,
            confidence: response.confidence,
            entry_price,
            stop_loss,
            take_profit: response.take_profit,
            regime,
            is_transitioning,
            decided_at: Utc::now(),
        }))
    }

    // =========================================================================
    // Loss cooldowns
    // =========================================================================

    pub fn pair_on_cooldown(&self, pair: &str) -> bool {
        let now_ms = Utc::now().timestamp_millis();
        self.cooldowns
            .read()
            .get(pair)
            .map(|expiry| *expiry > now_ms)
            .unwrap_or(false)
    }

    /// Update the per-pair cooldown state from a closed trade's NET result.
    pub fn record_trade_outcome(&self, pair: &str, net_pct: f64) {
        if net_pct >= 0.0 {
            self.cooldowns.write().remove(pair);
            self.loss_streaks.write().remove(pair);
            debug!(pair, "winning trade — cooldown cleared");
            return;
        }

        let streak = {
            let mut streaks = self.loss_streaks.write();
            let streak = streaks.entry(pair.to_string()).or_insert(0);
            *streak += 1;
            *streak
        };

        let cooldown_ms = if streak >= self.cfg.max_loss_streak {
            self.cfg.loss_cooldown_hours * 3_600_000
        } else {
            self.cfg.loss_cooldown_base_secs * 1_000 * i64::from(streak.min(3))
        };

        let expiry = Utc::now().timestamp_millis() + cooldown_ms;
        self.cooldowns.write().insert(pair.to_string(), expiry);
        warn!(
            pair,
            streak,
            cooldown_secs = cooldown_ms / 1_000,
            "losing trade — pair on cooldown"
        );
    }

    pub fn loss_streak(&self, pair: &str) -> u32 {
        self.loss_streaks.read().get(pair).copied().unwrap_or(0)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::exchange::{AssetBalance, ExchangeAdapter, OrderFill, OrderRequest};
    use crate::pubsub::MemoryBus;
    use crate::signal::SignalResponse;
    use crate::store::{InsertOutcome, MemoryStore, NewTrade};
    use crate::types::{
        BotConfig, BotStatus, Candle, SubscriptionStatus, TradeStatus, TradingMode,
    };
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubExchange;

    #[async_trait]
    impl ExchangeAdapter for StubExchange {
        async fn get_ticker(&self, pair: &str) -> AnyResult<MarketData> {
            Ok(MarketData {
                pair: pair.to_string(),
                price: 100_000.0,
                bid: 99_990.0,
                ask: 100_000.0,
                volume: 5.0,
                change_24h: 0.0,
                high_24h: 0.0,
                low_24h: 0.0,
                timestamp: Utc::now(),
            })
        }

        async fn get_ohlcv(&self, _p: &str, _tf: &str, limit: u32) -> AnyResult<Vec<Candle>> {
            // Trending series so regime detection finds a usable window.
            Ok((0..limit as i64)
                .map(|i| {
                    let base = 100.0 + i as f64 * 2.0;
                    Candle::new(i, i, base, base + 1.5, base - 0.5, base + 1.0, 10.0)
                })
                .collect())
        }

        async fn place_order(&self, req: &OrderRequest) -> AnyResult<OrderFill> {
            Ok(OrderFill {
                order_id: "1".into(),
                avg_price: req.price.unwrap_or(100_000.0),
                fee: 0.0,
                fee_asset: "USD".into(),
            })
        }

        async fn get_balances(&self) -> AnyResult<Vec<AssetBalance>> {
            Ok(Vec::new())
        }
    }

    struct StubSignals {
        confidence: f64,
        action: SignalAction,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SignalSource for StubSignals {
        async fn analyze_market(&self, req: &SignalRequest) -> AnyResult<SignalResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SignalResponse {
                signal: self.action,
                confidence: self.confidence,
                strength: None,
                entry_price: req.current_price,
                stop_loss: req.current_price * 0.95,
                take_profit: req.current_price * 1.05,
                regime: None,
            })
        }
    }

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        store: Arc<MemoryStore>,
        aggregator: Arc<MarketDataAggregator>,
        tracker: Arc<PositionTracker>,
    }

    fn harness(confidence: f64, action: SignalAction) -> Harness {
        let cfg = EngineConfig::default();
        let store = Arc::new(MemoryStore::new());
        let cache: Arc<dyn crate::cache::CacheStore> = Arc::new(MemoryCache::new());
        let exchange: Arc<dyn ExchangeAdapter> = Arc::new(StubExchange);

        let aggregator = Arc::new(MarketDataAggregator::new(
            exchange.clone(),
            cache,
            Duration::from_secs(10),
            60_000,
            Duration::from_secs(15),
        ));
        let ohlc = Arc::new(OhlcCache::new(exchange.clone(), Duration::from_secs(60)));
        let trade_store: Arc<dyn TradeStore> = store.clone();
        let regime = Arc::new(RegimeDetector::new(
            ohlc.clone(),
            trade_store.clone(),
            Duration::from_secs(300),
        ));
        let risk = Arc::new(RiskManager::new(&cfg));
        let tracker = Arc::new(PositionTracker::new(cfg.erosion_min_peak_pct));
        let momentum = Arc::new(MomentumFailureDetector::new());

        let mut adapters: HashMap<String, Arc<dyn ExchangeAdapter>> = HashMap::new();
        adapters.insert("binance".into(), exchange);
        let fanout = Arc::new(ExecutionFanOut::new(
            trade_store.clone(),
            store.clone(),
            adapters,
            cfg.default_stop_loss_pct,
            cfg.taker_fee_pct,
            Box::new(|| false),
        ));

        let signals: Arc<dyn SignalSource> = Arc::new(StubSignals {
            confidence,
            action,
            calls: AtomicUsize::new(0),
        });
        let bus: Arc<dyn PubSubBus> = Arc::new(MemoryBus::new());

        let orchestrator = Arc::new(Orchestrator::new(
            cfg,
            trade_store,
            store.clone(),
            aggregator.clone(),
            ohlc,
            regime,
            risk,
            tracker.clone(),
            momentum,
            fanout,
            signals,
            bus,
        ));

        Harness {
            orchestrator,
            store,
            aggregator,
            tracker,
        }
    }

    fn seed_bot(store: &MemoryStore, id: i64, sub: SubscriptionStatus) {
        store.seed_bot(
            BotInstance {
                id,
                user_id: id * 10,
                exchange: "binance".into(),
                enabled_pairs: vec!["BTC/USD".into()],
                status: BotStatus::Running,
                trading_mode: TradingMode::Paper,
                config: BotConfig {
                    initial_capital: 1_000.0,
                },
            },
            sub,
        );
    }

    async fn seed_open_trade(store: &MemoryStore, bot_id: i64, entry: f64, age_min: i64) -> i64 {
        let outcome = store
            .insert_trade(&NewTrade {
                bot_instance_id: bot_id,
                pair: "BTC/USD".into(),
                side: Side::Buy,
                entry_price: entry,
                quantity: 0.01,
                entry_time: Utc::now() - chrono::Duration::minutes(age_min),
                stop_loss: 0.0,
                take_profit: 0.0,
                fee: entry * 0.01 * 0.001,
                idempotency_key: format!("seed-{bot_id}-{age_min}"),
                trading_mode: TradingMode::Paper,
            })
            .await
            .unwrap();
        match outcome {
            InsertOutcome::Inserted(id) => id,
            InsertOutcome::Duplicate => panic!("seed collision"),
        }
    }

    fn moderate_regime() -> Regime {
        Regime {
            kind: RegimeKind::Moderate,
            confidence: 0.7,
            reason: "test".into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscription_revoked_pauses_bot_but_exits_still_monitored() {
        // S5: the bot is auto-paused, no new entries run, but its open trade
        // keeps being exit-monitored and closes normally.
        let h = harness(85.0, SignalAction::Buy);
        seed_bot(&h.store, 1, SubscriptionStatus::PastDue);
        let trade_id = seed_open_trade(&h.store, 1, 100_000.0, 60).await;

        let valid = h.orchestrator.reload_bots().await;
        assert!(valid.is_empty());
        assert_eq!(h.store.bot_by_id(1).unwrap().status, BotStatus::Paused);

        // Price collapses: the emergency stop closes the paused bot's trade.
        h.aggregator.apply_update("BTC/USD", 90_000.0, None, None);
        h.orchestrator.set_regime("BTC/USD", moderate_regime());
        h.orchestrator.profit_exit_pass().await;

        let trade = h.store.trade_by_id(trade_id).unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.exit_reason.as_deref(), Some(exit_reason::EMERGENCY_STOP));
    }

    #[tokio::test]
    async fn profit_target_exit_by_regime() {
        let h = harness(85.0, SignalAction::Buy);
        seed_bot(&h.store, 1, SubscriptionStatus::Active);
        let trade_id = seed_open_trade(&h.store, 1, 100_000.0, 60).await;

        h.orchestrator.set_regime("BTC/USD", moderate_regime());
        // Net ~2.3 % clears the moderate 2.0 % target.
        h.aggregator.apply_update("BTC/USD", 102_500.0, None, None);
        h.orchestrator.profit_exit_pass().await;

        let trade = h.store.trade_by_id(trade_id).unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.exit_reason.as_deref(), Some(exit_reason::PROFIT_TARGET));
        // A winning close clears the cooldown books.
        assert!(!h.orchestrator.pair_on_cooldown("BTC/USD"));
    }

    #[tokio::test]
    async fn underwater_never_profited_closes_past_age_gate() {
        // S2: choppy regime, 20 minutes old, loss beyond the -0.8 % bucket.
        let h = harness(85.0, SignalAction::Buy);
        seed_bot(&h.store, 1, SubscriptionStatus::Active);
        let trade_id = seed_open_trade(&h.store, 1, 100_000.0, 20).await;

        h.orchestrator.set_regime(
            "BTC/USD",
            Regime {
                kind: RegimeKind::Choppy,
                ..moderate_regime()
            },
        );

        // Net -0.65 %: inside the -0.8 % threshold — no close.
        h.aggregator.apply_update("BTC/USD", 99_550.0, None, None);
        h.orchestrator.profit_exit_pass().await;
        assert_eq!(h.store.trade_by_id(trade_id).unwrap().status, TradeStatus::Open);

        // Net -1.05 %: breached — closes as never-profited.
        h.aggregator.apply_update("BTC/USD", 99_150.0, None, None);
        h.orchestrator.profit_exit_pass().await;
        let trade = h.store.trade_by_id(trade_id).unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(
            trade.exit_reason.as_deref(),
            Some(exit_reason::UNDERWATER_NEVER_PROFITED)
        );
        // The losing close starts a cooldown.
        assert!(h.orchestrator.pair_on_cooldown("BTC/USD"));
        assert_eq!(h.orchestrator.loss_streak("BTC/USD"), 1);
    }

    #[tokio::test]
    async fn peak_pass_erosion_protects_profit() {
        // S1 shape: walk the price up, erode past the moderate cap, close
        // green with erosion_cap_protected.
        let h = harness(85.0, SignalAction::Buy);
        seed_bot(&h.store, 1, SubscriptionStatus::Active);
        let trade_id = seed_open_trade(&h.store, 1, 100_000.0, 30).await;
        h.orchestrator.set_regime("BTC/USD", moderate_regime());

        for price in [100_300.0, 100_500.0, 100_800.0, 100_700.0, 100_650.0] {
            h.aggregator.apply_update("BTC/USD", price, None, None);
            h.orchestrator.peak_pass().await;
            assert_eq!(
                h.store.trade_by_id(trade_id).unwrap().status,
                TradeStatus::Open,
                "premature close at {price}"
            );
        }

        // Peak net = 0.8 - 0.2 fees = 0.6; at 100380 net = 0.18, erosion
        // used 0.42 > 0.40 * 0.6.
        h.aggregator.apply_update("BTC/USD", 100_380.0, None, None);
        h.orchestrator.peak_pass().await;

        let trade = h.store.trade_by_id(trade_id).unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(
            trade.exit_reason.as_deref(),
            Some(exit_reason::EROSION_CAP_PROTECTED)
        );
        assert!(trade.profit_loss_percent.unwrap() > 0.0);
        assert!(!h.tracker.is_tracked(trade_id));
    }

    #[tokio::test]
    async fn fast_loop_ignores_red_trades() {
        // Green-to-red alone must NOT close on the fast loop; only the main
        // loop's table decides underwater exits.
        let h = harness(85.0, SignalAction::Buy);
        seed_bot(&h.store, 1, SubscriptionStatus::Active);
        let trade_id = seed_open_trade(&h.store, 1, 100_000.0, 2).await;
        h.orchestrator.set_regime("BTC/USD", moderate_regime());

        h.aggregator.apply_update("BTC/USD", 100_600.0, None, None);
        h.orchestrator.peak_pass().await;
        h.aggregator.apply_update("BTC/USD", 99_700.0, None, None);
        h.orchestrator.peak_pass().await;

        assert_eq!(h.store.trade_by_id(trade_id).unwrap().status, TradeStatus::Open);
    }

    #[tokio::test]
    async fn entry_pass_creates_trade_for_eligible_bot() {
        let h = harness(85.0, SignalAction::Buy);
        seed_bot(&h.store, 1, SubscriptionStatus::Active);
        h.orchestrator.set_regime("BTC/USD", moderate_regime());

        let market = MarketData {
            pair: "BTC/USD".into(),
            price: 100_000.0,
            bid: 99_995.0,
            ask: 100_000.0,
            volume: 5.0,
            change_24h: 0.0,
            high_24h: 0.0,
            low_24h: 0.0,
            timestamp: Utc::now(),
        };
        let ind = IndicatorSnapshot {
            adx: 30.0,
            adx_slope: 0.8,
            rsi: 55.0,
            momentum_1h: 0.4,
            momentum_4h: 1.0,
            volume_ratio: 1.2,
            intrabar_momentum: 0.1,
        };

        let decision = h
            .orchestrator
            .evaluate_pair_entry("BTC/USD", &market, &ind)
            .await
            .unwrap()
            .expect("expected a buy decision");
        assert_eq!(decision.regime, RegimeKind::Moderate);
        assert!(!decision.is_transitioning);

        let plans = h
            .orchestrator
            .fanout
            .fan_out_trade_decision(&decision, &HashSet::new())
            .await;
        let report = h.orchestrator.fanout.execute_trades_direct(&plans).await;
        assert_eq!(report.executed, 1);
        assert!(h.store.find_open(1, "BTC/USD").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn low_confidence_is_rejected_at_stage_five() {
        let h = harness(55.0, SignalAction::Buy);
        h.orchestrator.set_regime("BTC/USD", moderate_regime());

        let market = MarketData {
            pair: "BTC/USD".into(),
            price: 100_000.0,
            bid: 99_995.0,
            ask: 100_000.0,
            volume: 5.0,
            change_24h: 0.0,
            high_24h: 0.0,
            low_24h: 0.0,
            timestamp: Utc::now(),
        };
        let ind = IndicatorSnapshot {
            adx: 30.0,
            adx_slope: 0.8,
            rsi: 55.0,
            momentum_1h: 0.4,
            momentum_4h: 1.0,
            volume_ratio: 1.2,
            intrabar_momentum: 0.1,
        };

        let rejection = h
            .orchestrator
            .evaluate_pair_entry("BTC/USD", &market, &ind)
            .await
            .unwrap_err();
        assert_eq!(rejection.stage, "ai_validation");
    }

    #[tokio::test]
    async fn hold_signal_produces_no_decision_and_no_rejection() {
        let h = harness(90.0, SignalAction::Hold);
        h.orchestrator.set_regime("BTC/USD", moderate_regime());

        let market = MarketData {
            pair: "BTC/USD".into(),
            price: 100_000.0,
            bid: 99_995.0,
            ask: 100_000.0,
            volume: 5.0,
            change_24h: 0.0,
            high_24h: 0.0,
            low_24h: 0.0,
            timestamp: Utc::now(),
        };
        let ind = IndicatorSnapshot {
            adx: 30.0,
            adx_slope: 0.8,
            rsi: 55.0,
            momentum_1h: 0.4,
            momentum_4h: 1.0,
            volume_ratio: 1.2,
            intrabar_momentum: 0.1,
        };

        let result = h
            .orchestrator
            .evaluate_pair_entry("BTC/USD", &market, &ind)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn cooldown_scales_with_streak_and_clears_on_win() {
        let h = harness(85.0, SignalAction::Buy);

        h.orchestrator.record_trade_outcome("BTC/USD", -1.0);
        assert!(h.orchestrator.pair_on_cooldown("BTC/USD"));
        assert_eq!(h.orchestrator.loss_streak("BTC/USD"), 1);

        h.orchestrator.record_trade_outcome("BTC/USD", -1.0);
        assert_eq!(h.orchestrator.loss_streak("BTC/USD"), 2);

        h.orchestrator.record_trade_outcome("BTC/USD", 0.5);
        assert!(!h.orchestrator.pair_on_cooldown("BTC/USD"));
        assert_eq!(h.orchestrator.loss_streak("BTC/USD"), 0);
    }

    #[tokio::test]
    async fn streak_cap_sidelines_pair() {
        let h = harness(85.0, SignalAction::Buy);
        for _ in 0..5 {
            h.orchestrator.record_trade_outcome("BTC/USD", -1.0);
        }
        assert_eq!(h.orchestrator.loss_streak("BTC/USD"), 5);
        assert!(h.orchestrator.pair_on_cooldown("BTC/USD"));
    }

    #[tokio::test]
    async fn stale_flat_trade_closes_after_time_exit_window() {
        let h = harness(85.0, SignalAction::Buy);
        seed_bot(&h.store, 1, SubscriptionStatus::Active);
        // 49 hours old, price back at entry (flat).
        let trade_id = seed_open_trade(&h.store, 1, 100_000.0, 49 * 60).await;

        h.orchestrator.set_regime("BTC/USD", moderate_regime());
        // Net = 0.3 gross - 0.2 fees = +0.1 %: flat, not stale-underwater.
        h.aggregator.apply_update("BTC/USD", 100_300.0, None, None);
        h.orchestrator.profit_exit_pass().await;

        let trade = h.store.trade_by_id(trade_id).unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(
            trade.exit_reason.as_deref(),
            Some(exit_reason::STALE_FLAT_TRADE)
        );
    }
}
