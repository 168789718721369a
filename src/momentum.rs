// =============================================================================
// Momentum Failure Detector — multi-signal exit voting
// =============================================================================
//
// Counts independent bearish votes over an open position:
//
//   1. 1 h momentum turned negative after being positive since entry.
//   2. ADX slope steeply falling while ADX is still above 25 (exhaustion).
//   3. RSI crossed below 50 after having exceeded 60.
//   4. Volume ratio below 0.7 combined with negative intrabar momentum.
//
// Two votes force the exit. Positions younger than five minutes tag it
// `momentum_failure_early`, everything else `momentum_failure_late`.
//
// Votes 1 and 3 need memory of what the position has seen since entry, so
// the detector keeps a small per-trade state that is cleared on close.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::types::{exit_reason, IndicatorSnapshot};

/// Votes required to force an exit.
const EXIT_VOTES: usize = 2;

/// ADX slope treated as steeply falling.
const STEEP_FALL: f64 = -1.0;

/// Age (minutes) below which an exit is tagged early.
const EARLY_MINUTES: i64 = 5;

#[derive(Debug, Default, Clone)]
struct TradeMemory {
    momentum_was_positive: bool,
    rsi_high_watermark: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MomentumVerdict {
    pub should_exit: bool,
    pub votes: usize,
    pub reason: Option<&'static str>,
}

#[derive(Default)]
pub struct MomentumFailureDetector {
    memory: RwLock<HashMap<i64, TradeMemory>>,
}

impl MomentumFailureDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate one open position against the current indicator snapshot.
    pub fn evaluate(
        &self,
        trade_id: i64,
        age_minutes: i64,
        ind: &IndicatorSnapshot,
    ) -> MomentumVerdict {
        let mut memory = self.memory.write();
        let state = memory.entry(trade_id).or_default();

        if ind.momentum_1h > 0.0 {
            state.momentum_was_positive = true;
        }
        state.rsi_high_watermark = state.rsi_high_watermark.max(ind.rsi);

        let mut votes = 0;

        // 1. Momentum flipped negative after entry.
        if state.momentum_was_positive && ind.momentum_1h < 0.0 {
            votes += 1;
        }

        // 2. Trend exhaustion: strong trend, steeply falling slope.
        if ind.adx > 25.0 && ind.adx_slope < STEEP_FALL {
            votes += 1;
        }

        // 3. RSI rolled over from above 60 to below 50.
        if state.rsi_high_watermark > 60.0 && ind.rsi < 50.0 {
            votes += 1;
        }

        // 4. Fading volume with a red bar.
        if ind.volume_ratio < 0.7 && ind.intrabar_momentum < 0.0 {
            votes += 1;
        }

        let should_exit = votes >= EXIT_VOTES;
        let reason = should_exit.then(|| {
            if age_minutes < EARLY_MINUTES {
                exit_reason::MOMENTUM_FAILURE_EARLY
            } else {
                exit_reason::MOMENTUM_FAILURE_LATE
            }
        });

        if should_exit {
            debug!(trade_id, votes, age_minutes, "momentum failure detected");
        }

        MomentumVerdict {
            should_exit,
            votes,
            reason,
        }
    }

    /// Drop memory for a closed trade.
    pub fn clear(&self, trade_id: i64) {
        self.memory.write().remove(&trade_id);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn neutral() -> IndicatorSnapshot {
        IndicatorSnapshot {
            adx: 30.0,
            adx_slope: 0.2,
            rsi: 55.0,
            momentum_1h: 0.3,
            momentum_4h: 0.8,
            volume_ratio: 1.1,
            intrabar_momentum: 0.1,
        }
    }

    #[test]
    fn healthy_position_keeps_running() {
        let d = MomentumFailureDetector::new();
        let verdict = d.evaluate(1, 30, &neutral());
        assert!(!verdict.should_exit);
        assert_eq!(verdict.votes, 0);
    }

    #[test]
    fn single_vote_is_not_enough() {
        let d = MomentumFailureDetector::new();
        d.evaluate(1, 30, &neutral());

        // Only vote 2 fires: exhaustion.
        let ind = IndicatorSnapshot {
            adx_slope: -2.0,
            ..neutral()
        };
        let verdict = d.evaluate(1, 30, &ind);
        assert_eq!(verdict.votes, 1);
        assert!(!verdict.should_exit);
    }

    #[test]
    fn two_votes_force_late_exit() {
        let d = MomentumFailureDetector::new();
        d.evaluate(1, 30, &neutral()); // momentum positive remembered

        let ind = IndicatorSnapshot {
            momentum_1h: -0.4,   // vote 1
            adx_slope: -2.0,     // vote 2
            ..neutral()
        };
        let verdict = d.evaluate(1, 30, &ind);
        assert!(verdict.should_exit);
        assert_eq!(verdict.reason, Some(exit_reason::MOMENTUM_FAILURE_LATE));
    }

    #[test]
    fn young_position_tags_early() {
        let d = MomentumFailureDetector::new();
        d.evaluate(1, 1, &neutral());

        let ind = IndicatorSnapshot {
            momentum_1h: -0.4,
            volume_ratio: 0.5,
            intrabar_momentum: -0.2,
            ..neutral()
        };
        let verdict = d.evaluate(1, 2, &ind);
        assert!(verdict.should_exit);
        assert_eq!(verdict.reason, Some(exit_reason::MOMENTUM_FAILURE_EARLY));
    }

    #[test]
    fn rsi_rollover_requires_prior_high() {
        let d = MomentumFailureDetector::new();

        // RSI never exceeded 60 — a dip below 50 alone casts no vote.
        let low = IndicatorSnapshot {
            rsi: 45.0,
            ..neutral()
        };
        let verdict = d.evaluate(1, 30, &low);
        assert_eq!(verdict.votes, 0);

        // Now the position sees RSI 65 then a drop below 50.
        let d = MomentumFailureDetector::new();
        d.evaluate(2, 10, &IndicatorSnapshot { rsi: 65.0, ..neutral() });
        let verdict = d.evaluate(2, 30, &IndicatorSnapshot { rsi: 48.0, ..neutral() });
        assert_eq!(verdict.votes, 1);
    }

    #[test]
    fn momentum_flip_requires_prior_positive() {
        let d = MomentumFailureDetector::new();

        // Momentum negative from the first observation: no flip vote.
        let ind = IndicatorSnapshot {
            momentum_1h: -0.4,
            ..neutral()
        };
        let verdict = d.evaluate(1, 30, &ind);
        assert_eq!(verdict.votes, 0);
    }

    #[test]
    fn clear_resets_memory() {
        let d = MomentumFailureDetector::new();
        d.evaluate(1, 10, &IndicatorSnapshot { rsi: 65.0, ..neutral() });
        d.clear(1);

        // After clear, the RSI watermark is gone.
        let verdict = d.evaluate(1, 30, &IndicatorSnapshot { rsi: 48.0, ..neutral() });
        assert_eq!(verdict.votes, 0);
    }
}
