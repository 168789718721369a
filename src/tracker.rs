// =============================================================================
// Position Tracker — peak bookkeeping and profit-protection exits
// =============================================================================
//
// One entry per open trade, created on first observation and overwrite-once:
// repeated `record_peak` calls are ignored so the fast loop can never reset
// a peak. `update_peak_if_higher` is the sole writer of `peak_price_pct`,
// which is monotonically non-decreasing for the life of the trade.
//
// Exit rules evaluated here:
//   - Erosion cap: once the peak exceeds the arming floor (strict), the
//     trade may surrender at most a regime-scaled fraction of that peak.
//   - Underwater: the time-and-regime threshold table decides; trades that
//     were briefly profitable are never gated behind the raw age gate.
//
// Peak changes are batched in a dirty set and mirrored to the store by
// `flush_pending_updates`.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::store::TradeStore;
use crate::types::{exit_reason, RegimeKind};

/// Peak state for one open trade. Absolute mode carries the position data;
/// degraded mode (position data unavailable at creation) tracks only the
/// percentage.
#[derive(Debug, Clone)]
pub struct PeakState {
    pub pair: String,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_time_ms: i64,
    /// NET percent. Never decreases.
    pub peak_price_pct: f64,
    /// Peak unrealised dollars at the peak (absolute mode).
    pub peak_price_absolute: f64,
    pub fees_at_peak: f64,
    pub last_update_ms: i64,
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErosionVerdict {
    pub should_exit: bool,
    pub reason: Option<&'static str>,
    pub peak_profit_pct: f64,
    pub erosion_used_pct: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnderwaterVerdict {
    pub should_exit: bool,
    pub reason: Option<&'static str>,
    pub peak_profit_pct: f64,
}

/// Fraction of peak profit a trade may surrender before a forced exit.
pub fn erosion_cap_fraction(regime: RegimeKind) -> f64 {
    match regime {
        RegimeKind::Strong => 0.50,
        RegimeKind::Moderate => 0.40,
        RegimeKind::Transitioning => 0.35,
        RegimeKind::Weak => 0.30,
        RegimeKind::Choppy => 0.25,
    }
}

/// Age- and regime-scaled underwater threshold (percent, negative).
/// `trending` means moderate or strong.
pub fn underwater_threshold_pct(age_minutes: i64, trending: bool) -> f64 {
    match age_minutes {
        m if m <= 5 => {
            if trending {
                -1.5
            } else {
                -1.0
            }
        }
        m if m <= 30 => {
            if trending {
                -2.5
            } else {
                -0.8
            }
        }
        m if m <= 180 => {
            if trending {
                -3.5
            } else {
                -0.6
            }
        }
        m if m <= 1440 => {
            if trending {
                -4.5
            } else {
                -0.4
            }
        }
        _ => {
            if trending {
                -5.5
            } else {
                -0.3
            }
        }
    }
}

pub struct PositionTracker {
    /// Peak (strict) above which the erosion cap arms.
    erosion_min_peak_pct: f64,
    peaks: RwLock<HashMap<i64, PeakState>>,
    dirty: RwLock<HashSet<i64>>,
}

impl PositionTracker {
    pub fn new(erosion_min_peak_pct: f64) -> Self {
        Self {
            erosion_min_peak_pct,
            peaks: RwLock::new(HashMap::new()),
            dirty: RwLock::new(HashSet::new()),
        }
    }

    pub fn is_tracked(&self, trade_id: i64) -> bool {
        self.peaks.read().contains_key(&trade_id)
    }

    /// `true` when the tracker holds position data (absolute mode) for the
    /// trade.
    pub fn has_position_data(&self, trade_id: i64) -> bool {
        self.peaks
            .read()
            .get(&trade_id)
            .map(|p| !p.degraded)
            .unwrap_or(false)
    }

    pub fn peak_of(&self, trade_id: i64) -> Option<f64> {
        self.peaks.read().get(&trade_id).map(|p| p.peak_price_pct)
    }

    /// Initialise tracking for a trade. Overwrite-once: a second call is
    /// ignored so the fast loop cannot reset an established peak.
    #[allow(clippy::too_many_arguments)]
    pub fn record_peak(
        &self,
        trade_id: i64,
        pair: &str,
        net_profit_pct: f64,
        entry_time_ms: i64,
        entry_price: f64,
        quantity: f64,
        current_price: f64,
        entry_fees_dollars: f64,
    ) {
        let mut peaks = self.peaks.write();
        if peaks.contains_key(&trade_id) {
            return;
        }

        let absolute = (current_price - entry_price) * quantity - entry_fees_dollars;
        peaks.insert(
            trade_id,
            PeakState {
                pair: pair.to_string(),
                entry_price,
                quantity,
                entry_time_ms,
                peak_price_pct: net_profit_pct,
                peak_price_absolute: absolute.max(0.0),
                fees_at_peak: entry_fees_dollars,
                last_update_ms: Utc::now().timestamp_millis(),
                degraded: false,
            },
        );
        drop(peaks);
        self.dirty.write().insert(trade_id);
        debug!(trade_id, pair, net_profit_pct, "peak tracking started");
    }

    /// Degraded-mode fallback when position data was unavailable at
    /// creation: percentage tracking only.
    pub fn record_peak_pct_only(&self, trade_id: i64, pair: &str, net_profit_pct: f64) {
        let mut peaks = self.peaks.write();
        if peaks.contains_key(&trade_id) {
            return;
        }
        peaks.insert(
            trade_id,
            PeakState {
                pair: pair.to_string(),
                entry_price: 0.0,
                quantity: 0.0,
                entry_time_ms: 0,
                peak_price_pct: net_profit_pct,
                peak_price_absolute: 0.0,
                fees_at_peak: 0.0,
                last_update_ms: Utc::now().timestamp_millis(),
                degraded: true,
            },
        );
        drop(peaks);
        self.dirty.write().insert(trade_id);
        warn!(trade_id, pair, "peak tracking started in degraded (pct-only) mode");
    }

    /// Monotonically raise the peak. Returns `true` when the peak moved.
    pub fn update_peak_if_higher(
        &self,
        trade_id: i64,
        net_profit_pct: f64,
        current_price: f64,
        fees_dollars: f64,
    ) -> bool {
        let mut peaks = self.peaks.write();
        let Some(state) = peaks.get_mut(&trade_id) else {
            return false;
        };

        if net_profit_pct <= state.peak_price_pct {
            return false;
        }

        state.peak_price_pct = net_profit_pct;
        state.last_update_ms = Utc::now().timestamp_millis();
        if !state.degraded {
            state.fees_at_peak = fees_dollars;
            state.peak_price_absolute =
                ((current_price - state.entry_price) * state.quantity - fees_dollars).max(0.0);
        }
        drop(peaks);

        self.dirty.write().insert(trade_id);
        true
    }

    /// Erosion-cap evaluation. Only arms once the recorded peak strictly
    /// exceeds the arming floor.
    pub fn check_erosion_cap(
        &self,
        trade_id: i64,
        pair: &str,
        net_profit_pct: f64,
        regime: RegimeKind,
        current_price: f64,
    ) -> ErosionVerdict {
        let peak = match self.peak_of(trade_id) {
            Some(p) => p,
            None => {
                return ErosionVerdict {
                    should_exit: false,
                    reason: None,
                    peak_profit_pct: 0.0,
                    erosion_used_pct: 0.0,
                }
            }
        };

        let erosion_used = (peak - net_profit_pct).max(0.0);

        // Strict: a peak exactly at the floor does not arm.
        if peak <= self.erosion_min_peak_pct {
            return ErosionVerdict {
                should_exit: false,
                reason: None,
                peak_profit_pct: peak,
                erosion_used_pct: erosion_used,
            };
        }

        let allowed = erosion_cap_fraction(regime) * peak;
        if erosion_used <= allowed {
            return ErosionVerdict {
                should_exit: false,
                reason: None,
                peak_profit_pct: peak,
                erosion_used_pct: erosion_used,
            };
        }

        let reason = if net_profit_pct > 0.0 {
            exit_reason::EROSION_CAP_PROTECTED
        } else {
            exit_reason::GREEN_TO_RED
        };

        debug!(
            trade_id,
            pair,
            peak = format!("{peak:.3}"),
            net = format!("{net_profit_pct:.3}"),
            used = format!("{erosion_used:.3}"),
            allowed = format!("{allowed:.3}"),
            price = current_price,
            reason,
            "erosion cap triggered"
        );

        ErosionVerdict {
            should_exit: true,
            reason: Some(reason),
            peak_profit_pct: peak,
            erosion_used_pct: erosion_used,
        }
    }

    /// Underwater evaluation against a threshold chosen by the caller from
    /// [`underwater_threshold_pct`].
    ///
    /// Trades whose peak armed the erosion logic are treated as profitable
    /// collapses and are never gated behind `min_minutes`; small-peak and
    /// never-profited trades wait out the age gate.
    #[allow(clippy::too_many_arguments)]
    pub fn check_underwater_exit(
        &self,
        trade_id: i64,
        pair: &str,
        net_profit_pct: f64,
        entry_time: DateTime<Utc>,
        now: DateTime<Utc>,
        threshold_pct: f64,
        min_minutes: i64,
    ) -> UnderwaterVerdict {
        let peak = self.peak_of(trade_id).unwrap_or(0.0);

        let mut age_minutes = (now - entry_time).num_minutes();
        if age_minutes < 0 {
            warn!(
                trade_id,
                pair,
                entry_time = %entry_time,
                "future-dated entry time — clamping age to 0"
            );
            age_minutes = 0;
        }

        if net_profit_pct > threshold_pct {
            return UnderwaterVerdict {
                should_exit: false,
                reason: None,
                peak_profit_pct: peak,
            };
        }

        let reason = if peak > self.erosion_min_peak_pct {
            Some(exit_reason::UNDERWATER_PROFITABLE_COLLAPSE)
        } else if peak > 0.0 {
            (age_minutes >= min_minutes).then_some(exit_reason::UNDERWATER_SMALL_PEAK_TIMEOUT)
        } else {
            (age_minutes >= min_minutes).then_some(exit_reason::UNDERWATER_NEVER_PROFITED)
        };

        UnderwaterVerdict {
            should_exit: reason.is_some(),
            reason,
            peak_profit_pct: peak,
        }
    }

    /// Drop tracking state for a closed trade. Idempotent; callers only
    /// clear after a confirmed close.
    pub fn clear_position(&self, trade_id: i64) {
        self.peaks.write().remove(&trade_id);
        self.dirty.write().remove(&trade_id);
    }

    /// Mirror batched peak changes to persistent storage.
    pub async fn flush_pending_updates(&self, store: &Arc<dyn TradeStore>) {
        // Locks are taken one at a time (drain dirty, then read peaks) so
        // this never deadlocks against the peak writers.
        let drained: Vec<i64> = {
            let mut dirty = self.dirty.write();
            dirty.drain().collect()
        };
        let pending: Vec<(i64, f64)> = {
            let peaks = self.peaks.read();
            drained
                .iter()
                .filter_map(|id| peaks.get(id).map(|p| (*id, p.peak_price_pct)))
                .collect()
        };

        for (trade_id, peak_pct) in pending {
            if let Err(e) = store.record_peak(trade_id, peak_pct).await {
                debug!(trade_id, error = %e, "peak mirror failed — will retry on next change");
                self.dirty.write().insert(trade_id);
            }
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.peaks.read().len()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn tracker() -> PositionTracker {
        PositionTracker::new(0.3)
    }

    fn seed(t: &PositionTracker, trade_id: i64) {
        t.record_peak(
            trade_id,
            "BTC/USD",
            0.0,
            Utc::now().timestamp_millis(),
            100_000.0,
            0.01,
            100_000.0,
            0.26,
        );
    }

    #[test]
    fn record_peak_is_overwrite_once() {
        let t = tracker();
        seed(&t, 1);
        t.update_peak_if_higher(1, 0.5, 100_500.0, 1.26);

        // A second record_peak must not reset the established peak.
        t.record_peak(
            1,
            "BTC/USD",
            0.0,
            Utc::now().timestamp_millis(),
            100_000.0,
            0.01,
            100_000.0,
            0.26,
        );
        assert_eq!(t.peak_of(1), Some(0.5));
    }

    #[test]
    fn peak_is_monotonic() {
        let t = tracker();
        seed(&t, 1);

        let observations = [0.2, 0.5, 0.3, 0.64, 0.1, 0.64];
        let mut last_peak = 0.0;
        for net in observations {
            t.update_peak_if_higher(1, net, 100_000.0 * (1.0 + net / 100.0), 1.0);
            let peak = t.peak_of(1).unwrap();
            assert!(peak >= last_peak, "peak decreased: {last_peak} -> {peak}");
            last_peak = peak;
        }
        assert_eq!(last_peak, 0.64);
    }

    #[test]
    fn erosion_cap_does_not_arm_at_floor_exactly() {
        // Boundary: peak == EROSION_MIN_PEAK_PCT must not arm (strict >).
        let t = tracker();
        seed(&t, 1);
        t.update_peak_if_higher(1, 0.3, 100_300.0, 1.0);

        let verdict = t.check_erosion_cap(1, "BTC/USD", -5.0, RegimeKind::Choppy, 95_000.0);
        assert!(!verdict.should_exit);
        assert_eq!(verdict.peak_profit_pct, 0.3);
    }

    #[test]
    fn erosion_cap_protects_green_trade() {
        // S1 shape: entry 100000, walk to a 0.674 % net peak, then erode
        // past the moderate cap (0.40 of peak). The trade is still green at
        // the trigger, so the reason is erosion_cap_protected.
        let t = tracker();
        seed(&t, 1);

        let fee_pct = 0.026 + 0.1; // entry $0.26 on $1000 + taker exit
        for price in [100_300.0, 100_500.0, 100_800.0_f64] {
            let gross = (price - 100_000.0) / 100_000.0 * 100.0;
            t.update_peak_if_higher(1, gross - fee_pct, price, 1.26);
        }
        let peak = t.peak_of(1).unwrap();
        assert!((peak - (0.8 - fee_pct)).abs() < 1e-9);

        // 100700 / 100650: still inside the cap.
        for price in [100_700.0, 100_650.0_f64] {
            let net = (price - 100_000.0) / 100_000.0 * 100.0 - fee_pct;
            let verdict = t.check_erosion_cap(1, "BTC/USD", net, RegimeKind::Moderate, price);
            assert!(!verdict.should_exit, "premature exit at {price}");
        }

        // 100380: net 0.254, erosion used 0.42 > 0.40 * 0.674.
        let price = 100_380.0;
        let net = (price - 100_000.0) / 100_000.0 * 100.0 - fee_pct;
        let verdict = t.check_erosion_cap(1, "BTC/USD", net, RegimeKind::Moderate, price);
        assert!(verdict.should_exit);
        assert_eq!(verdict.reason, Some(exit_reason::EROSION_CAP_PROTECTED));
        assert!(net > 0.0, "trade must still be green");
        assert!(verdict.erosion_used_pct > erosion_cap_fraction(RegimeKind::Moderate) * peak);
    }

    #[test]
    fn erosion_past_zero_tags_green_to_red() {
        let t = tracker();
        seed(&t, 1);
        t.update_peak_if_higher(1, 1.0, 101_000.0, 1.0);

        let verdict = t.check_erosion_cap(1, "BTC/USD", -0.2, RegimeKind::Strong, 99_800.0);
        assert!(verdict.should_exit);
        assert_eq!(verdict.reason, Some(exit_reason::GREEN_TO_RED));
    }

    #[test]
    fn erosion_cap_table() {
        assert_eq!(erosion_cap_fraction(RegimeKind::Strong), 0.50);
        assert_eq!(erosion_cap_fraction(RegimeKind::Moderate), 0.40);
        assert_eq!(erosion_cap_fraction(RegimeKind::Transitioning), 0.35);
        assert_eq!(erosion_cap_fraction(RegimeKind::Weak), 0.30);
        assert_eq!(erosion_cap_fraction(RegimeKind::Choppy), 0.25);
    }

    #[test]
    fn underwater_threshold_table() {
        // Every age bucket, trending vs choppy.
        assert_eq!(underwater_threshold_pct(3, true), -1.5);
        assert_eq!(underwater_threshold_pct(3, false), -1.0);
        assert_eq!(underwater_threshold_pct(20, true), -2.5);
        assert_eq!(underwater_threshold_pct(20, false), -0.8);
        assert_eq!(underwater_threshold_pct(100, true), -3.5);
        assert_eq!(underwater_threshold_pct(100, false), -0.6);
        assert_eq!(underwater_threshold_pct(1000, true), -4.5);
        assert_eq!(underwater_threshold_pct(1000, false), -0.4);
        assert_eq!(underwater_threshold_pct(2000, true), -5.5);
        assert_eq!(underwater_threshold_pct(2000, false), -0.3);
    }

    #[test]
    fn underwater_never_profited_respects_age_gate() {
        // S2 shape: choppy regime, never green. At 8 minutes the -0.8 %
        // threshold applies but -0.6 % does not breach it; at -0.85 % past
        // the minimum age the exit fires.
        let t = tracker();
        seed(&t, 1);
        let now = Utc::now();
        let entry = now - chrono::Duration::minutes(9);

        let threshold = underwater_threshold_pct(9, false);
        assert_eq!(threshold, -0.8);

        let verdict = t.check_underwater_exit(1, "BTC/USD", -0.6, entry, now, threshold, 5);
        assert!(!verdict.should_exit);

        let verdict = t.check_underwater_exit(1, "BTC/USD", -0.85, entry, now, threshold, 5);
        assert!(verdict.should_exit);
        assert_eq!(verdict.reason, Some(exit_reason::UNDERWATER_NEVER_PROFITED));
    }

    #[test]
    fn underwater_age_gate_holds_young_trades() {
        let t = tracker();
        seed(&t, 1);
        let now = Utc::now();
        let entry = now - chrono::Duration::minutes(2);

        let verdict = t.check_underwater_exit(1, "BTC/USD", -5.0, entry, now, -1.0, 15);
        assert!(!verdict.should_exit);
    }

    #[test]
    fn briefly_profitable_trade_is_not_age_gated() {
        // The peak armed the erosion logic, so the collapse exit ignores the
        // minimum-age gate entirely.
        let t = tracker();
        seed(&t, 1);
        t.update_peak_if_higher(1, 0.6, 100_600.0, 1.0);

        let now = Utc::now();
        let entry = now - chrono::Duration::minutes(2);
        let verdict = t.check_underwater_exit(1, "BTC/USD", -1.2, entry, now, -1.0, 15);
        assert!(verdict.should_exit);
        assert_eq!(
            verdict.reason,
            Some(exit_reason::UNDERWATER_PROFITABLE_COLLAPSE)
        );
    }

    #[test]
    fn small_peak_times_out() {
        let t = tracker();
        seed(&t, 1);
        t.update_peak_if_higher(1, 0.1, 100_100.0, 1.0);

        let now = Utc::now();
        let entry = now - chrono::Duration::minutes(20);
        let verdict = t.check_underwater_exit(1, "BTC/USD", -1.0, entry, now, -0.8, 15);
        assert!(verdict.should_exit);
        assert_eq!(
            verdict.reason,
            Some(exit_reason::UNDERWATER_SMALL_PEAK_TIMEOUT)
        );
    }

    #[test]
    fn future_entry_time_clamps_age() {
        let t = tracker();
        seed(&t, 1);
        let now = Utc::now();
        let entry = now + chrono::Duration::minutes(30);

        // Age clamps to 0, so the age gate holds.
        let verdict = t.check_underwater_exit(1, "BTC/USD", -5.0, entry, now, -1.0, 15);
        assert!(!verdict.should_exit);

        // With no gate the exit is still eligible despite the bad timestamp.
        let verdict = t.check_underwater_exit(1, "BTC/USD", -5.0, entry, now, -1.0, 0);
        assert!(verdict.should_exit);
    }

    #[test]
    fn clear_position_is_idempotent() {
        let t = tracker();
        seed(&t, 1);
        assert!(t.is_tracked(1));
        t.clear_position(1);
        assert!(!t.is_tracked(1));
        t.clear_position(1);
        assert!(!t.is_tracked(1));
    }

    #[tokio::test]
    async fn flush_mirrors_dirty_peaks() {
        let t = tracker();
        seed(&t, 1);
        t.update_peak_if_higher(1, 0.8, 100_800.0, 1.0);

        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn TradeStore> = store.clone();
        t.flush_pending_updates(&dyn_store).await;
        assert_eq!(store.recorded_peak(1), Some(0.8));

        // Nothing dirty: a second flush writes nothing new.
        t.clear_position(1);
        t.flush_pending_updates(&dyn_store).await;
        assert_eq!(store.recorded_peak(1), Some(0.8));
    }

    #[test]
    fn degraded_mode_tracks_pct_only() {
        let t = tracker();
        t.record_peak_pct_only(7, "ETH/USD", 0.2);
        assert!(t.is_tracked(7));
        assert!(!t.has_position_data(7));
        t.update_peak_if_higher(7, 0.5, 0.0, 0.0);
        assert_eq!(t.peak_of(7), Some(0.5));
    }
}
