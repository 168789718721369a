// =============================================================================
// Postgres store — production TradeStore / BotStore
// =============================================================================
//
// Runtime-checked sqlx queries against the schema below. All timestamp
// columns are zone-less; every read is forced to UTC at this boundary.
// Mixing locally-interpreted and UTC values has broken exit branches before,
// so the conversion is centralised in `force_utc`.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::{info, warn};

use crate::types::{
    BotConfig, BotInstance, BotStatus, PyramidLevel, PyramidStatus, Regime, Side,
    SubscriptionStatus, Trade, TradeStatus, TradingMode,
};

use super::{
    close_precheck, BotStore, CloseOutcome, CloseRequest, InsertOutcome, NewTrade, TradeStore,
};

/// Engine-owned tables. Applied idempotently at startup.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bot_instances (
    id              BIGSERIAL PRIMARY KEY,
    user_id         BIGINT NOT NULL,
    exchange        TEXT NOT NULL,
    enabled_pairs   TEXT[] NOT NULL DEFAULT '{}',
    status          TEXT NOT NULL DEFAULT 'paused',
    trading_mode    TEXT NOT NULL DEFAULT 'paper',
    config          JSONB NOT NULL DEFAULT '{}',
    created_at      TIMESTAMP NOT NULL DEFAULT (now() AT TIME ZONE 'utc'),
    updated_at      TIMESTAMP NOT NULL DEFAULT (now() AT TIME ZONE 'utc')
);

CREATE TABLE IF NOT EXISTS trades (
    id                  BIGSERIAL PRIMARY KEY,
    bot_instance_id     BIGINT NOT NULL,
    pair                TEXT NOT NULL,
    side                TEXT NOT NULL,
    entry_price         DOUBLE PRECISION NOT NULL,
    quantity            DOUBLE PRECISION NOT NULL,
    entry_time          TIMESTAMP NOT NULL,
    stop_loss           DOUBLE PRECISION NOT NULL DEFAULT 0,
    take_profit         DOUBLE PRECISION NOT NULL DEFAULT 0,
    fee                 DOUBLE PRECISION NOT NULL DEFAULT 0,
    pyramid_levels      JSONB NOT NULL DEFAULT '[]',
    status              TEXT NOT NULL DEFAULT 'open',
    exit_price          DOUBLE PRECISION,
    exit_time           TIMESTAMP,
    profit_loss         DOUBLE PRECISION,
    profit_loss_percent DOUBLE PRECISION,
    exit_reason         TEXT,
    peak_profit_pct     DOUBLE PRECISION,
    idempotency_key     TEXT NOT NULL UNIQUE,
    trading_mode        TEXT NOT NULL DEFAULT 'paper'
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_trades_open
    ON trades (bot_instance_id, pair) WHERE status = 'open';

CREATE TABLE IF NOT EXISTS market_regime (
    id          BIGSERIAL PRIMARY KEY,
    pair        TEXT NOT NULL,
    timestamp   TIMESTAMP NOT NULL,
    regime      TEXT NOT NULL,
    confidence  DOUBLE PRECISION NOT NULL,
    reason      TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS subscriptions (
    user_id BIGINT PRIMARY KEY,
    status  TEXT NOT NULL DEFAULT 'none'
);
"#;

/// Zone-less store timestamps are UTC by contract.
fn force_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(naive, Utc)
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the engine schema (idempotent).
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("schema statement failed: {statement}"))?;
        }
        info!("database schema ready");
        Ok(())
    }

    fn trade_from_row(row: &sqlx::postgres::PgRow) -> Result<Trade> {
        let side: String = row.try_get("side")?;
        let status: String = row.try_get("status")?;
        let mode: String = row.try_get("trading_mode")?;
        let levels: serde_json::Value = row.try_get("pyramid_levels")?;
        let entry_time: NaiveDateTime = row.try_get("entry_time")?;
        let exit_time: Option<NaiveDateTime> = row.try_get("exit_time")?;

        let pyramid_levels: Vec<PyramidLevel> =
            serde_json::from_value(levels).unwrap_or_default();

        Ok(Trade {
            id: row.try_get("id")?,
            bot_instance_id: row.try_get("bot_instance_id")?,
            pair: row.try_get("pair")?,
            side: if side == "sell" { Side::Sell } else { Side::Buy },
            entry_price: row.try_get("entry_price")?,
            quantity: row.try_get("quantity")?,
            entry_time: force_utc(entry_time),
            stop_loss: row.try_get("stop_loss")?,
            take_profit: row.try_get("take_profit")?,
            fee: row.try_get("fee")?,
            pyramid_levels,
            status: if status == "closed" {
                TradeStatus::Closed
            } else {
                TradeStatus::Open
            },
            exit_price: row.try_get("exit_price")?,
            exit_time: exit_time.map(force_utc),
            profit_loss: row.try_get("profit_loss")?,
            profit_loss_percent: row.try_get("profit_loss_percent")?,
            exit_reason: row.try_get("exit_reason")?,
            idempotency_key: row.try_get("idempotency_key")?,
            trading_mode: if mode == "live" {
                TradingMode::Live
            } else {
                TradingMode::Paper
            },
        })
    }

    fn bot_from_row(row: &sqlx::postgres::PgRow) -> Result<BotInstance> {
        let status: String = row.try_get("status")?;
        let mode: String = row.try_get("trading_mode")?;
        let config: serde_json::Value = row.try_get("config")?;

        Ok(BotInstance {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            exchange: row.try_get("exchange")?,
            enabled_pairs: row.try_get("enabled_pairs")?,
            status: if status == "running" {
                BotStatus::Running
            } else {
                BotStatus::Paused
            },
            trading_mode: if mode == "live" {
                TradingMode::Live
            } else {
                TradingMode::Paper
            },
            config: serde_json::from_value::<BotConfig>(config).unwrap_or_default(),
        })
    }
}

const TRADE_COLUMNS: &str = "id, bot_instance_id, pair, side, entry_price, quantity, entry_time, \
     stop_loss, take_profit, fee, pyramid_levels, status, exit_price, exit_time, \
     profit_loss, profit_loss_percent, exit_reason, idempotency_key, trading_mode";

#[async_trait]
impl TradeStore for PgStore {
    async fn insert_trade(&self, trade: &NewTrade) -> Result<InsertOutcome> {
        let row = sqlx::query(
            "INSERT INTO trades (bot_instance_id, pair, side, entry_price, quantity, \
             entry_time, stop_loss, take_profit, fee, idempotency_key, trading_mode) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (idempotency_key) DO NOTHING \
             RETURNING id",
        )
        .bind(trade.bot_instance_id)
        .bind(&trade.pair)
        .bind(trade.side.as_str())
        .bind(trade.entry_price)
        .bind(trade.quantity)
        .bind(trade.entry_time.naive_utc())
        .bind(trade.stop_loss)
        .bind(trade.take_profit)
        .bind(trade.fee)
        .bind(&trade.idempotency_key)
        .bind(trade.trading_mode.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("trade insert failed")?;

        match row {
            Some(row) => Ok(InsertOutcome::Inserted(row.try_get("id")?)),
            None => Ok(InsertOutcome::Duplicate),
        }
    }

    async fn find_open(&self, bot_id: i64, pair: &str) -> Result<Option<Trade>> {
        let row = sqlx::query(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades \
             WHERE bot_instance_id = $1 AND pair = $2 AND status = 'open' LIMIT 1"
        ))
        .bind(bot_id)
        .bind(pair)
        .fetch_optional(&self.pool)
        .await
        .context("open-trade lookup failed")?;

        row.as_ref().map(Self::trade_from_row).transpose()
    }

    async fn open_trades(&self) -> Result<Vec<Trade>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades WHERE status = 'open' ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("open-trades query failed")?;

        rows.iter().map(Self::trade_from_row).collect()
    }

    async fn open_trades_for_pair(&self, pair: &str) -> Result<Vec<Trade>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades \
             WHERE status = 'open' AND pair = $1 ORDER BY id"
        ))
        .bind(pair)
        .fetch_all(&self.pool)
        .await
        .context("open-trades-for-pair query failed")?;

        rows.iter().map(Self::trade_from_row).collect()
    }

    async fn close_trade(&self, req: &CloseRequest) -> Result<CloseOutcome> {
        if let Some(outcome) = close_precheck(req) {
            return Ok(outcome);
        }

        // `status = 'open'` in the WHERE clause is the serialisation point:
        // whichever exit pass gets here first wins, the loser sees 0 rows.
        let row = sqlx::query(
            "UPDATE trades SET status = 'closed', exit_price = $2, exit_time = $3, \
             profit_loss = $4, profit_loss_percent = $5, exit_reason = $6 \
             WHERE id = $1 AND status = 'open' \
             RETURNING id",
        )
        .bind(req.trade_id)
        .bind(req.exit_price)
        .bind(req.exit_time.naive_utc())
        .bind(req.profit_loss)
        .bind(req.profit_loss_percent)
        .bind(&req.exit_reason)
        .fetch_optional(&self.pool)
        .await
        .context("trade close failed")?;

        Ok(match row {
            Some(_) => CloseOutcome::Closed,
            None => CloseOutcome::AlreadyClosed,
        })
    }

    async fn recent_closed(&self, bot_id: i64, limit: i64) -> Result<Vec<Trade>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades \
             WHERE bot_instance_id = $1 AND status = 'closed' \
             ORDER BY exit_time DESC NULLS LAST LIMIT $2"
        ))
        .bind(bot_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent-closed query failed")?;

        rows.iter().map(Self::trade_from_row).collect()
    }

    async fn add_pyramid_level(&self, trade_id: i64, level: &PyramidLevel) -> Result<()> {
        let payload = serde_json::to_value(level).context("pyramid level serialise failed")?;
        sqlx::query(
            "UPDATE trades SET pyramid_levels = pyramid_levels || jsonb_build_array($2::jsonb) \
             WHERE id = $1",
        )
        .bind(trade_id)
        .bind(payload)
        .execute(&self.pool)
        .await
        .context("pyramid level append failed")?;
        Ok(())
    }

    async fn set_pyramid_status(
        &self,
        trade_id: i64,
        level: u8,
        status: PyramidStatus,
    ) -> Result<()> {
        // Read-modify-write: pyramid lists are tiny (≤ 2 entries).
        let row = sqlx::query("SELECT pyramid_levels FROM trades WHERE id = $1")
            .bind(trade_id)
            .fetch_optional(&self.pool)
            .await
            .context("pyramid status read failed")?;

        let Some(row) = row else {
            warn!(trade_id, "pyramid status update for unknown trade");
            return Ok(());
        };

        let value: serde_json::Value = row.try_get("pyramid_levels")?;
        let mut levels: Vec<PyramidLevel> = serde_json::from_value(value).unwrap_or_default();
        if let Some(pl) = levels.iter_mut().find(|pl| pl.level == level) {
            pl.status = status;
        }

        sqlx::query("UPDATE trades SET pyramid_levels = $2 WHERE id = $1")
            .bind(trade_id)
            .bind(serde_json::to_value(&levels)?)
            .execute(&self.pool)
            .await
            .context("pyramid status write failed")?;
        Ok(())
    }

    async fn record_peak(&self, trade_id: i64, peak_pct: f64) -> Result<()> {
        // GREATEST keeps the stored peak monotone even if flushes reorder.
        sqlx::query(
            "UPDATE trades SET peak_profit_pct = GREATEST(COALESCE(peak_profit_pct, 0), $2) \
             WHERE id = $1",
        )
        .bind(trade_id)
        .bind(peak_pct)
        .execute(&self.pool)
        .await
        .context("peak mirror failed")?;
        Ok(())
    }

    async fn insert_regime(&self, pair: &str, regime: &Regime) -> Result<()> {
        sqlx::query(
            "INSERT INTO market_regime (pair, timestamp, regime, confidence, reason) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(pair)
        .bind(regime.timestamp.naive_utc())
        .bind(regime.kind.as_str())
        .bind(regime.confidence)
        .bind(&regime.reason)
        .execute(&self.pool)
        .await
        .context("regime insert failed")?;
        Ok(())
    }
}

#[async_trait]
impl BotStore for PgStore {
    async fn running_bots(&self) -> Result<Vec<BotInstance>> {
        let rows = sqlx::query(
            "SELECT id, user_id, exchange, enabled_pairs, status, trading_mode, config \
             FROM bot_instances WHERE status = 'running' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("running-bots query failed")?;

        rows.iter().map(Self::bot_from_row).collect()
    }

    async fn subscription_status(&self, user_id: i64) -> Result<SubscriptionStatus> {
        let row = sqlx::query("SELECT status FROM subscriptions WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("subscription lookup failed")?;

        Ok(match row {
            Some(row) => {
                let status: String = row.try_get("status")?;
                SubscriptionStatus::from_db(&status)
            }
            None => SubscriptionStatus::None,
        })
    }

    async fn pause_bot(&self, bot_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE bot_instances SET status = 'paused', \
             updated_at = (now() AT TIME ZONE 'utc') WHERE id = $1",
        )
        .bind(bot_id)
        .execute(&self.pool)
        .await
        .context("bot pause failed")?;
        Ok(())
    }
}
