// =============================================================================
// Meridian Trade Engine — Main Entry Point
// =============================================================================
//
// One long-lived process shared across all users. The engine elects a single
// price-stream leader through the distributed cache, runs the orchestrator's
// main and peak-tracking loops (or the event-driven worker when
// ENGINE_MODE=worker), and shuts down cleanly on Ctrl+C: tickers stop,
// pending peak updates flush, and the leader lease is released.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod cache;
mod config;
mod exchange;
mod fanout;
mod indicators;
mod leader;
mod market_data;
mod momentum;
mod orchestrator;
mod pubsub;
mod regime;
mod risk;
mod signal;
mod sizer;
mod store;
mod tracker;
mod types;
mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cache::{CacheStore, MemoryCache, RedisCache};
use crate::config::EngineConfig;
use crate::exchange::{ExchangeAdapter, RestExchange};
use crate::fanout::ExecutionFanOut;
use crate::leader::LeaderElection;
use crate::market_data::{MarketDataAggregator, OhlcCache, PriceStream};
use crate::momentum::MomentumFailureDetector;
use crate::orchestrator::Orchestrator;
use crate::pubsub::{MemoryBus, PgBus, PubSubBus};
use crate::regime::RegimeDetector;
use crate::risk::RiskManager;
use crate::signal::{HttpSignalSource, SignalSource};
use crate::store::{BotStore, MemoryStore, PgStore, TradeStore};
use crate::tracker::PositionTracker;
use crate::types::price_channel;
use crate::worker::TradeWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Trade Engine — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let cfg = EngineConfig::load("engine_config.json")?;
    let pairs = cfg.pairs.clone();
    let instance_id = uuid::Uuid::new_v4().to_string();
    info!(instance = %instance_id, pairs = ?pairs, "engine instance configured");

    // ── 2. Stores & pub-sub ──────────────────────────────────────────────
    let (trade_store, bot_store, bus): (
        Arc<dyn TradeStore>,
        Arc<dyn BotStore>,
        Arc<dyn PubSubBus>,
    ) = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await?;
            let store = Arc::new(PgStore::new(pool.clone()));
            store.migrate().await?;
            let bus = PgBus::start(pool)
                .await
                .map_err(|e| anyhow::anyhow!("pub-sub bus start failed: {e}"))?;
            info!("postgres store and NOTIFY/LISTEN bus ready");
            (store.clone(), store, bus)
        }
        Err(_) => {
            warn!("DATABASE_URL not set — using in-memory store and bus (paper only)");
            let store = Arc::new(MemoryStore::new());
            (store.clone(), store, Arc::new(MemoryBus::new()))
        }
    };

    // ── 3. Distributed cache ─────────────────────────────────────────────
    let dist_cache: Arc<dyn CacheStore> = match std::env::var("REDIS_URL") {
        Ok(url) => match RedisCache::connect(&url).await {
            Ok(cache) => {
                info!("redis distributed cache connected");
                Arc::new(cache)
            }
            Err(e) => {
                warn!(error = %e, "redis unavailable — falling back to in-memory cache");
                Arc::new(MemoryCache::new())
            }
        },
        Err(_) => {
            warn!("REDIS_URL not set — using in-memory cache (single instance)");
            Arc::new(MemoryCache::new())
        }
    };

    // ── 4. Exchange clients ──────────────────────────────────────────────
    let api_key = std::env::var("EXCHANGE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("EXCHANGE_API_SECRET").unwrap_or_default();

    let exchange: Arc<dyn ExchangeAdapter> =
        Arc::new(RestExchange::new(api_key.clone(), api_secret.clone()));
    // The aggregator gets its own direct client so its polling never dents
    // the shared rate budget.
    let aggregator_client: Arc<dyn ExchangeAdapter> =
        Arc::new(RestExchange::new(api_key, api_secret));

    // ── 5. Core components ───────────────────────────────────────────────
    let aggregator = Arc::new(MarketDataAggregator::new(
        aggregator_client,
        dist_cache.clone(),
        Duration::from_millis(cfg.market_cache_ttl_ms as u64),
        cfg.market_stale_ttl_ms,
        Duration::from_secs(cfg.dist_cache_ttl_secs),
    ));
    let ohlc = Arc::new(OhlcCache::new(
        exchange.clone(),
        Duration::from_secs(cfg.ohlc_cache_ttl_secs),
    ));
    let regime = Arc::new(RegimeDetector::new(
        ohlc.clone(),
        trade_store.clone(),
        Duration::from_secs(cfg.regime_cache_ttl_secs),
    ));
    let risk = Arc::new(RiskManager::new(&cfg));
    let tracker = Arc::new(PositionTracker::new(cfg.erosion_min_peak_pct));
    let momentum = Arc::new(MomentumFailureDetector::new());

    let mut adapters: HashMap<String, Arc<dyn ExchangeAdapter>> = HashMap::new();
    adapters.insert("binance".to_string(), exchange.clone());

    let risk_for_gate = risk.clone();
    let fanout = Arc::new(ExecutionFanOut::new(
        trade_store.clone(),
        bot_store.clone(),
        adapters,
        cfg.default_stop_loss_pct,
        cfg.taker_fee_pct,
        Box::new(move || risk_for_gate.reference_trending_down()),
    ));

    let signal_url = std::env::var("SIGNAL_SERVICE_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:8100/analyze".to_string());
    let signals: Arc<dyn SignalSource> = Arc::new(HttpSignalSource::new(
        signal_url,
        std::env::var("SIGNAL_SERVICE_KEY").ok(),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        cfg.clone(),
        trade_store,
        bot_store,
        aggregator.clone(),
        ohlc,
        regime,
        risk,
        tracker,
        momentum,
        fanout,
        signals,
        bus.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 6. Follower price intake ─────────────────────────────────────────
    // Every instance mirrors pub-sub price ticks into its local cache; the
    // leader additionally feeds it straight from the websocket.
    for pair in &pairs {
        let agg = aggregator.clone();
        if let Err(e) = bus
            .subscribe(
                &price_channel(pair),
                Arc::new(move |payload| {
                    if let Ok(update) = serde_json::from_str::<types::PriceUpdate>(payload) {
                        agg.apply_update(&update.pair, update.price, update.bid, update.ask);
                    }
                }),
            )
            .await
        {
            warn!(pair = %pair, error = %e, "price channel subscription failed");
        }
    }

    // ── 7. Leader election + price stream ────────────────────────────────
    let stream = Arc::new(PriceStream::new(dist_cache.clone(), bus.clone()));
    {
        let agg = aggregator.clone();
        stream.subscribe_local(Arc::new(move |update| {
            agg.apply_update(&update.pair, update.price, update.bid, update.ask);
        }));
    }

    let election = Arc::new(LeaderElection::new(
        dist_cache,
        instance_id.clone(),
        Duration::from_secs(cfg.leader_ttl_secs),
    ));

    {
        let election = election.clone();
        let stream = stream.clone();
        let pairs = pairs.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(election.heartbeat_interval());
            let mut stream_task: Option<tokio::task::JoinHandle<()>> = None;

            loop {
                tokio::select! {
                    _ = heartbeat.tick() => {
                        let is_leader = election.heartbeat().await;
                        let running = stream_task
                            .as_ref()
                            .map(|t| !t.is_finished())
                            .unwrap_or(false);

                        if is_leader && !running {
                            stream.rearm();
                            let stream = stream.clone();
                            let pairs = pairs.clone();
                            stream_task = Some(tokio::spawn(async move {
                                stream.run(&pairs).await;
                            }));
                        } else if !is_leader && running {
                            // Loss of leadership is an intentional disconnect.
                            stream.disconnect();
                        }
                    }
                    _ = shutdown.changed() => {
                        stream.disconnect();
                        election.release().await;
                        return;
                    }
                }
            }
        });
    }

    // ── 8. Market data refresher ─────────────────────────────────────────
    {
        let aggregator = aggregator.clone();
        let pairs = pairs.clone();
        let mut shutdown = shutdown_rx.clone();
        let every = Duration::from_secs(cfg.refresh_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => aggregator.fetch_fresh(&pairs).await,
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // ── 9. Decision loops ────────────────────────────────────────────────
    let engine_mode = std::env::var("ENGINE_MODE").unwrap_or_else(|_| "orchestrator".into());
    match engine_mode.as_str() {
        "worker" => {
            info!("starting in event-driven worker mode");
            let worker = TradeWorker::new(orchestrator.clone(), bus.clone(), pairs.clone());
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move { worker.run(shutdown).await });
        }
        _ => {
            info!("starting in orchestrator mode");
            let main_loop = orchestrator.clone();
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move { main_loop.run_main_loop(shutdown).await });
        }
    }

    // The peak-tracking loop runs in every mode.
    {
        let peak_loop = orchestrator.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { peak_loop.run_peak_loop(shutdown).await });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if shutdown_tx.send(true).is_err() {
        error!("shutdown broadcast failed — receivers already gone");
    }
    // Give loops a moment to flush peaks and release the lease.
    tokio::time::sleep(Duration::from_millis(500)).await;

    info!("Meridian Trade Engine shut down complete.");
    Ok(())
}
