// =============================================================================
// Risk Manager — staged entry filter
// =============================================================================
//
// Five stages guard every entry; the first failure wins and is reported with
// a stage label plus a short reason for the rejection audit trail:
//
//   1. pre_filter    — spread gate + choppy intrabar guard (inputs computed
//                      by the orchestrator, enforced here)
//   2. health        — ADX floor; the [20, 25) zone passes only with a
//                      rising slope and flags the entry as transitioning
//   3. drop_protect  — market-wide momentum floor, panic volume, re-widened
//                      spread
//   4. entry_quality — RSI extreme top, dead momentum without slope recovery
//   5. ai_validation — performed by the orchestrator after consulting the
//                      signal source; the threshold lives here
//
// The pyramid gate is separate: level 1 needs AI confidence >= 85, level 2
// needs >= 90.
// =============================================================================

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::config::EngineConfig;
use crate::types::{IndicatorSnapshot, MarketData};

/// Pyramid confidence floors by level.
const PYRAMID_CONFIDENCE: [(u8, f64); 2] = [(1, 85.0), (2, 90.0)];

/// ADX below which the market counts as choppy for the intrabar guard and
/// the health gate.
const ADX_HEALTH_FLOOR: f64 = 20.0;

/// Upper bound of the transitioning zone.
const ADX_TRANSITION_CEILING: f64 = 25.0;

/// Inputs to stages 1–4 for one pair.
#[derive(Debug, Clone, Copy)]
pub struct EntryContext<'a> {
    pub market: &'a MarketData,
    pub indicators: &'a IndicatorSnapshot,
    /// Spread fraction computed by the orchestrator when the cycle started.
    pub prefilter_spread_pct: Option<f64>,
}

/// Filter verdict. A rejection carries the stage label and reason used
/// verbatim in the audit log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EntryVerdict {
    Pass { is_transitioning: bool },
    Reject { stage: &'static str, reason: String },
}

impl EntryVerdict {
    fn reject(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::Reject {
            stage,
            reason: reason.into(),
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self, Self::Pass { .. })
    }
}

pub struct RiskManager {
    max_entry_spread_pct: f64,
    min_intrabar_momentum_choppy: f64,
    rsi_extreme_top: f64,
    adx_rising_slope: f64,
    btc_drop_floor_pct: f64,
    panic_volume_ratio: f64,
    ai_confidence_threshold: f64,
    /// Reference-pair (BTC) momentum, refreshed each cycle by the
    /// orchestrator.
    reference_momentum: RwLock<f64>,
}

impl RiskManager {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            max_entry_spread_pct: cfg.max_entry_spread_pct,
            min_intrabar_momentum_choppy: cfg.min_intrabar_momentum_choppy,
            rsi_extreme_top: cfg.rsi_extreme_top,
            adx_rising_slope: cfg.adx_rising_slope,
            btc_drop_floor_pct: cfg.btc_drop_floor_pct,
            panic_volume_ratio: cfg.panic_volume_ratio,
            ai_confidence_threshold: cfg.ai_confidence_threshold,
            reference_momentum: RwLock::new(0.0),
        }
    }

    pub fn set_reference_momentum(&self, pct: f64) {
        *self.reference_momentum.write() = pct;
        debug!(momentum_pct = pct, "reference momentum updated");
    }

    pub fn reference_momentum(&self) -> f64 {
        *self.reference_momentum.read()
    }

    /// `true` when the market-wide trend gate should shrink position sizes.
    pub fn reference_trending_down(&self) -> bool {
        self.reference_momentum() < self.btc_drop_floor_pct
    }

    pub fn ai_confidence_threshold(&self) -> f64 {
        self.ai_confidence_threshold
    }

    /// Stage 5: compare signal confidence against the global threshold.
    pub fn validate_ai_confidence(&self, confidence: f64) -> EntryVerdict {
        if confidence < self.ai_confidence_threshold {
            EntryVerdict::reject(
                "ai_validation",
                format!(
                    "confidence {:.0} below threshold {:.0}",
                    confidence, self.ai_confidence_threshold
                ),
            )
        } else {
            EntryVerdict::Pass {
                is_transitioning: false,
            }
        }
    }

    /// Stages 1–4. First failure wins.
    pub fn evaluate_entry(&self, ctx: &EntryContext<'_>) -> EntryVerdict {
        let ind = ctx.indicators;

        // ── Stage 1: pre-filter ─────────────────────────────────────────
        if let Some(spread) = ctx.prefilter_spread_pct {
            if spread > self.max_entry_spread_pct {
                return EntryVerdict::reject(
                    "pre_filter",
                    format!(
                        "spread {:.4} above cap {:.4}",
                        spread, self.max_entry_spread_pct
                    ),
                );
            }
        }
        if ind.adx < ADX_HEALTH_FLOOR && ind.intrabar_momentum < self.min_intrabar_momentum_choppy
        {
            return EntryVerdict::reject(
                "pre_filter",
                format!(
                    "choppy intrabar guard: adx {:.1}, intrabar {:.3}%",
                    ind.adx, ind.intrabar_momentum
                ),
            );
        }

        // ── Stage 2: health gate ────────────────────────────────────────
        if ind.adx < ADX_HEALTH_FLOOR {
            return EntryVerdict::reject(
                "health",
                format!("adx {:.1} below {ADX_HEALTH_FLOOR}", ind.adx),
            );
        }
        let is_transitioning = if ind.adx < ADX_TRANSITION_CEILING {
            if ind.adx_slope < self.adx_rising_slope {
                return EntryVerdict::reject(
                    "health",
                    format!(
                        "adx {:.1} in transition zone without rising slope ({:+.2})",
                        ind.adx, ind.adx_slope
                    ),
                );
            }
            true
        } else {
            false
        };

        // ── Stage 3: drop protection ────────────────────────────────────
        let reference = self.reference_momentum();
        if reference < self.btc_drop_floor_pct {
            return EntryVerdict::reject(
                "drop_protect",
                format!(
                    "reference momentum {:.2}% below floor {:.2}%",
                    reference, self.btc_drop_floor_pct
                ),
            );
        }
        if ind.volume_ratio >= self.panic_volume_ratio && ind.intrabar_momentum < 0.0 {
            return EntryVerdict::reject(
                "drop_protect",
                format!(
                    "panic volume spike: ratio {:.2} with intrabar {:.3}%",
                    ind.volume_ratio, ind.intrabar_momentum
                ),
            );
        }
        // Spread may have re-widened since the pre-filter snapshot.
        if let Some(spread) = ctx.market.spread_pct() {
            if spread > self.max_entry_spread_pct {
                return EntryVerdict::reject(
                    "drop_protect",
                    format!("spread re-widened to {:.4}", spread),
                );
            }
        }

        // ── Stage 4: entry quality ──────────────────────────────────────
        if ind.rsi >= self.rsi_extreme_top {
            return EntryVerdict::reject(
                "entry_quality",
                format!("rsi {:.1} at extreme top", ind.rsi),
            );
        }
        if ind.momentum_1h <= 0.0 && ind.adx_slope <= 0.0 {
            return EntryVerdict::reject(
                "entry_quality",
                format!(
                    "momentum {:.3}% with no slope recovery ({:+.2})",
                    ind.momentum_1h, ind.adx_slope
                ),
            );
        }

        EntryVerdict::Pass { is_transitioning }
    }

    /// Pyramid gate: each level has its own confidence floor; the ordered
    /// level list enforced by the store means level 2 cannot exist without
    /// level 1.
    pub fn can_add_pyramid_level(&self, level: u8, ai_confidence: f64) -> bool {
        PYRAMID_CONFIDENCE
            .iter()
            .find(|(l, _)| *l == level)
            .map(|(_, floor)| ai_confidence >= *floor)
            .unwrap_or(false)
    }
}
