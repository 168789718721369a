// =============================================================================
// Engine Configuration — loaded once at startup
// =============================================================================
//
// Every threshold the engine consults lives here. The struct is read from an
// optional JSON file, then selected fields are overridden from the
// environment. There is no hot reload: the orchestrator, tracker, and risk
// filter all capture the values they need at construction time.
//
// All fields carry `#[serde(default)]` so an older config file never breaks
// loading after a new field is added.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::RegimeKind;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_pairs() -> Vec<String> {
    vec![
        "BTC/USD".to_string(),
        "ETH/USD".to_string(),
        "SOL/USD".to_string(),
        "XRP/USD".to_string(),
        "LINK/USD".to_string(),
    ]
}

fn default_main_tick_secs() -> u64 {
    30
}

fn default_peak_tracking_interval_ms() -> u64 {
    1_000
}

fn default_refresh_interval_secs() -> u64 {
    4
}

fn default_market_cache_ttl_ms() -> i64 {
    10_000
}

fn default_market_stale_ttl_ms() -> i64 {
    15_000
}

fn default_dist_cache_ttl_secs() -> u64 {
    15
}

fn default_ohlc_cache_ttl_secs() -> u64 {
    60
}

fn default_regime_cache_ttl_secs() -> u64 {
    300
}

fn default_leader_ttl_secs() -> u64 {
    30
}

fn default_max_entry_spread_pct() -> f64 {
    0.003
}

fn default_min_intrabar_momentum_choppy() -> f64 {
    0.05
}

fn default_rsi_extreme_top() -> f64 {
    75.0
}

fn default_adx_rising_slope() -> f64 {
    0.5
}

fn default_btc_drop_floor_pct() -> f64 {
    -1.5
}

fn default_panic_volume_ratio() -> f64 {
    3.0
}

fn default_ai_confidence_threshold() -> f64 {
    70.0
}

fn default_erosion_min_peak_pct() -> f64 {
    0.3
}

fn default_underwater_min_minutes() -> i64 {
    15
}

fn default_stale_underwater_minutes() -> i64 {
    240
}

fn default_time_exit_hours() -> u32 {
    48
}

fn default_emergency_stop_loss_pct() -> f64 {
    -8.0
}

fn default_taker_fee_pct() -> f64 {
    0.1
}

fn default_default_stop_loss_pct() -> f64 {
    0.05
}

fn default_loss_cooldown_base_secs() -> i64 {
    300
}

fn default_max_loss_streak() -> u32 {
    5
}

fn default_loss_cooldown_hours() -> i64 {
    12
}

fn default_pyramid_min_adx() -> f64 {
    25.0
}

fn default_pyramid_triggers() -> Vec<f64> {
    vec![1.0, 2.0]
}

fn default_signal_timeframe() -> String {
    "1h".to_string()
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Meridian engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Universe ------------------------------------------------------------
    /// Pairs the engine watches. Bots may enable any subset.
    #[serde(default = "default_pairs")]
    pub pairs: Vec<String>,

    /// Pair used for the market-wide drop-protection momentum input.
    #[serde(default = "default_reference_pair")]
    pub reference_pair: String,

    // --- Cadence -------------------------------------------------------------
    /// Main orchestrator tick (seconds). Expected 20–60.
    #[serde(default = "default_main_tick_secs")]
    pub main_tick_secs: u64,

    /// High-frequency peak-tracking tick (milliseconds).
    #[serde(default = "default_peak_tracking_interval_ms")]
    pub peak_tracking_interval_ms: u64,

    /// Background market-data refresher interval (seconds).
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    // --- Cache TTLs ----------------------------------------------------------
    /// In-process market-data TTL (milliseconds).
    #[serde(default = "default_market_cache_ttl_ms")]
    pub market_cache_ttl_ms: i64,

    /// Age beyond which a market snapshot is rejected as stale (milliseconds).
    #[serde(default = "default_market_stale_ttl_ms")]
    pub market_stale_ttl_ms: i64,

    /// Distributed market-data TTL (seconds).
    #[serde(default = "default_dist_cache_ttl_secs")]
    pub dist_cache_ttl_secs: u64,

    /// OHLC fetch-cache TTL (seconds).
    #[serde(default = "default_ohlc_cache_ttl_secs")]
    pub ohlc_cache_ttl_secs: u64,

    /// Regime classification TTL (seconds).
    #[serde(default = "default_regime_cache_ttl_secs")]
    pub regime_cache_ttl_secs: u64,

    /// Leader lease TTL (seconds). Heartbeat fires at 30 % of this.
    #[serde(default = "default_leader_ttl_secs")]
    pub leader_ttl_secs: u64,

    // --- Entry filter --------------------------------------------------------
    /// Maximum acceptable (ask-bid)/bid at entry.
    #[serde(default = "default_max_entry_spread_pct")]
    pub max_entry_spread_pct: f64,

    /// Minimum intrabar momentum (percent) required when ADX < 20.
    #[serde(default = "default_min_intrabar_momentum_choppy")]
    pub min_intrabar_momentum_choppy: f64,

    /// RSI level treated as an extreme top.
    #[serde(default = "default_rsi_extreme_top")]
    pub rsi_extreme_top: f64,

    /// ADX slope above which the 20–25 zone counts as a rising transition.
    #[serde(default = "default_adx_rising_slope")]
    pub adx_rising_slope: f64,

    /// Reference-pair momentum floor; entries are blocked below it.
    #[serde(default = "default_btc_drop_floor_pct")]
    pub btc_drop_floor_pct: f64,

    /// Volume ratio treated as a panic spike when intrabar momentum is
    /// negative.
    #[serde(default = "default_panic_volume_ratio")]
    pub panic_volume_ratio: f64,

    /// Minimum AI confidence for any entry. Identical across regimes; the
    /// upstream signal source bakes regime into its confidence.
    #[serde(default = "default_ai_confidence_threshold")]
    pub ai_confidence_threshold: f64,

    // --- Exit logic ----------------------------------------------------------
    /// Peak (net percent) above which the erosion cap arms. Strict: a peak
    /// exactly at this value does not arm.
    #[serde(default = "default_erosion_min_peak_pct")]
    pub erosion_min_peak_pct: f64,

    /// Minimum age (minutes) before never-profited / small-peak underwater
    /// exits fire on the main loop.
    #[serde(default = "default_underwater_min_minutes")]
    pub underwater_min_minutes: i64,

    /// Age (minutes) beyond which any losing trade is closed as stale.
    #[serde(default = "default_stale_underwater_minutes")]
    pub stale_underwater_minutes: i64,

    /// Age (hours) beyond which a flat trade is closed.
    #[serde(default = "default_time_exit_hours")]
    pub time_exit_hours: u32,

    /// Gross loss (percent, negative) that forces an immediate exit.
    #[serde(default = "default_emergency_stop_loss_pct")]
    pub emergency_stop_loss_pct: f64,

    /// Taker fee percentage per side, used for NET profit arithmetic.
    #[serde(default = "default_taker_fee_pct")]
    pub taker_fee_pct: f64,

    /// Fallback stop-loss distance (fraction of price) when the signal does
    /// not carry a meaningful one.
    #[serde(default = "default_default_stop_loss_pct")]
    pub default_stop_loss_pct: f64,

    /// Per-regime net profit target (percent).
    #[serde(default)]
    pub profit_targets: ProfitTargets,

    // --- Loss cooldowns ------------------------------------------------------
    /// Base per-pair cooldown after a losing trade (seconds). Scaled by
    /// `min(streak, 3)`.
    #[serde(default = "default_loss_cooldown_base_secs")]
    pub loss_cooldown_base_secs: i64,

    /// Loss streak at which a pair is sidelined.
    #[serde(default = "default_max_loss_streak")]
    pub max_loss_streak: u32,

    /// Sideline duration (hours) once the streak cap is hit.
    #[serde(default = "default_loss_cooldown_hours")]
    pub loss_cooldown_hours: i64,

    // --- Pyramiding ----------------------------------------------------------
    /// Minimum ADX for any pyramid add.
    #[serde(default = "default_pyramid_min_adx")]
    pub pyramid_min_adx: f64,

    /// Net-profit milestones (percent) triggering levels 1 and 2.
    #[serde(default = "default_pyramid_triggers")]
    pub pyramid_triggers: Vec<f64>,

    // --- Signal source -------------------------------------------------------
    /// Timeframe passed to the signal source.
    #[serde(default = "default_signal_timeframe")]
    pub signal_timeframe: String,
}

fn default_reference_pair() -> String {
    "BTC/USD".to_string()
}

/// Per-regime net profit targets (percent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitTargets {
    pub strong: f64,
    pub moderate: f64,
    pub transitioning: f64,
    pub weak: f64,
    pub choppy: f64,
}

impl Default for ProfitTargets {
    fn default() -> Self {
        Self {
            strong: 3.0,
            moderate: 2.0,
            transitioning: 1.5,
            weak: 1.2,
            choppy: 0.8,
        }
    }
}

impl ProfitTargets {
    pub fn for_regime(&self, regime: RegimeKind) -> f64 {
        match regime {
            RegimeKind::Strong => self.strong,
            RegimeKind::Moderate => self.moderate,
            RegimeKind::Transitioning => self.transitioning,
            RegimeKind::Weak => self.weak,
            RegimeKind::Choppy => self.choppy,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("default config deserialises")
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file is absent, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config from {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse config from {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env();

        info!(
            path = %path.display(),
            pairs = ?config.pairs,
            main_tick_secs = config.main_tick_secs,
            peak_interval_ms = config.peak_tracking_interval_ms,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Environment overrides for the handful of knobs operators actually
    /// change between deployments.
    fn apply_env(&mut self) {
        if let Ok(pairs) = std::env::var("MERIDIAN_PAIRS") {
            let parsed: Vec<String> = pairs
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.pairs = parsed;
            }
        }
        if let Ok(v) = std::env::var("PEAK_TRACKING_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                self.peak_tracking_interval_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("MAIN_TICK_SECS") {
            if let Ok(secs) = v.parse() {
                self.main_tick_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("RISK_MAX_LOSS_STREAK") {
            if let Ok(n) = v.parse() {
                self.max_loss_streak = n;
            }
        }
        if let Ok(v) = std::env::var("RISK_LOSS_COOLDOWN_HOURS") {
            if let Ok(h) = v.parse() {
                self.loss_cooldown_hours = h;
            }
        }
        if let Ok(v) = std::env::var("EROSION_MIN_PEAK_PCT") {
            if let Ok(p) = v.parse() {
                self.erosion_min_peak_pct = p;
            }
        }
        if let Ok(v) = std::env::var("STALE_UNDERWATER_MINUTES") {
            if let Ok(m) = v.parse() {
                self.stale_underwater_minutes = m;
            }
        }
        if let Ok(v) = std::env::var("MAX_ENTRY_SPREAD_PCT") {
            if let Ok(p) = v.parse() {
                self.max_entry_spread_pct = p;
            }
        }
        if let Ok(v) = std::env::var("ENTRY_MIN_INTRABAR_MOMENTUM_CHOPPY") {
            if let Ok(p) = v.parse() {
                self.min_intrabar_momentum_choppy = p;
            }
        }
        if let Ok(v) = std::env::var("AI_CONFIDENCE_THRESHOLD") {
            if let Ok(c) = v.parse() {
                self.ai_confidence_threshold = c;
            }
        }
    }
}
