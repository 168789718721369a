// =============================================================================
// Trade Worker — event-driven deployment variant
// =============================================================================
//
// Instead of the periodic orchestrator tick, a worker subscribes to the
// per-pair price channels and reacts to every tick: first exit checks for
// all open trades on that pair, then entry evaluation for idle bots.
//
// Horizontal scaling is just running N workers: every worker sees every
// price message, and position mutations serialise in the database via the
// idempotency key and the open-position guard.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::indicators;
use crate::orchestrator::Orchestrator;
use crate::pubsub::PubSubBus;
use crate::types::{price_channel, PriceUpdate};

pub struct TradeWorker {
    orchestrator: Arc<Orchestrator>,
    bus: Arc<dyn PubSubBus>,
    pairs: Vec<String>,
}

impl TradeWorker {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        bus: Arc<dyn PubSubBus>,
        pairs: Vec<String>,
    ) -> Self {
        Self {
            orchestrator,
            bus,
            pairs,
        }
    }

    /// Subscribe to every pair channel and process ticks until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<PriceUpdate>();

        for pair in &self.pairs {
            let tx = tx.clone();
            let channel = price_channel(pair);
            let result = self
                .bus
                .subscribe(
                    &channel,
                    Arc::new(move |payload| {
                        match serde_json::from_str::<PriceUpdate>(payload) {
                            Ok(update) => {
                                let _ = tx.send(update);
                            }
                            Err(e) => debug!(error = %e, "undecodable price payload"),
                        }
                    }),
                )
                .await;

            match result {
                Ok(_) => debug!(channel = %channel, "worker subscribed"),
                Err(e) => warn!(channel = %channel, error = %e, "worker subscription failed"),
            }
        }

        info!(pairs = self.pairs.len(), "trade worker running");

        loop {
            tokio::select! {
                update = rx.recv() => match update {
                    Some(update) => self.on_price_tick(update).await,
                    None => return,
                },
                _ = shutdown.changed() => {
                    info!("trade worker stopping");
                    return;
                }
            }
        }
    }

    /// One tick: exits first, then entries.
    pub async fn on_price_tick(&self, update: PriceUpdate) {
        self.orchestrator
            .aggregator()
            .apply_update(&update.pair, update.price, update.bid, update.ask);

        // 1. Exit checks for open trades on this pair.
        match self
            .orchestrator
            .trade_store()
            .open_trades_for_pair(&update.pair)
            .await
        {
            Ok(trades) => {
                for trade in trades {
                    self.orchestrator.evaluate_exit_rules(&trade).await;
                }
            }
            Err(e) => debug!(pair = %update.pair, error = %e, "open-trade load failed"),
        }

        // 2. Entry evaluation for idle bots.
        if self.orchestrator.pair_on_cooldown(&update.pair) {
            return;
        }

        let Some(market) = self.orchestrator.aggregator().cached(&update.pair) else {
            return;
        };
        let candles = match self
            .orchestrator
            .ohlc()
            .fetch(&update.pair, "1h", 100)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                debug!(pair = %update.pair, error = %e, "worker candle fetch failed");
                return;
            }
        };
        let Some(ind) = indicators::compute_snapshot(&candles) else {
            return;
        };

        match self
            .orchestrator
            .evaluate_pair_entry(&update.pair, &market, &ind)
            .await
        {
            Ok(Some(decision)) => {
                let plans = self
                    .orchestrator
                    .fanout()
                    .fan_out_trade_decision(&decision, &HashSet::new())
                    .await;
                if !plans.is_empty() {
                    self.orchestrator.fanout().execute_trades_direct(&plans).await;
                }
            }
            Ok(None) => {}
            Err(rejection) => {
                debug!(
                    pair = %rejection.pair,
                    stage = rejection.stage,
                    reason = %rejection.reason,
                    "worker entry rejected"
                );
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_channels_follow_pair_naming() {
        let pairs = vec!["BTC/USD".to_string(), "ETH/USDT".to_string()];
        let channels: Vec<String> = pairs.iter().map(|p| price_channel(p)).collect();
        assert_eq!(channels[0], "price_updates_btc_usd");
        assert_eq!(channels[1], "price_updates_eth_usdt");
    }
}
