// =============================================================================
// Dynamic Position Sizer — Kelly-calibrated quantities
// =============================================================================
//
// Quantity derivation for one execution plan:
//
//   kelly       = w - (1 - w) / payoff            (clamped to [0, cap])
//   risk $      = balance * kelly * confidence scale
//   quantity    = risk $ / (price * stop_loss_pct)
//
// Win rate and payoff ratio are calibrated from the bot's last 100 closed
// trades; a fresh bot uses conservative priors. The fan-out then applies the
// regime multiplier and the capital-preservation multiplier on top.
// =============================================================================

use tracing::debug;

use crate::types::{RegimeKind, Trade};

/// Kelly fraction cap: never risk more than a quarter of the balance on the
/// stop distance.
const KELLY_CAP: f64 = 0.25;

/// Priors for bots without trade history.
const PRIOR_WIN_RATE: f64 = 0.50;
const PRIOR_PAYOFF: f64 = 1.50;

/// Capital-preservation floor.
const PRESERVATION_FLOOR: f64 = 0.25;

pub struct DynamicPositionSizer {
    balance: f64,
    win_rate: f64,
    payoff_ratio: f64,
}

impl DynamicPositionSizer {
    pub fn new(balance: f64) -> Self {
        Self {
            balance,
            win_rate: PRIOR_WIN_RATE,
            payoff_ratio: PRIOR_PAYOFF,
        }
    }

    /// Calibrate win rate and payoff from closed trades (newest first, at
    /// most the last 100 are considered). Fewer than 10 trades keeps the
    /// priors.
    pub fn calibrate(&mut self, closed: &[Trade]) {
        let sample: Vec<f64> = closed
            .iter()
            .take(100)
            .filter_map(|t| t.profit_loss)
            .collect();

        if sample.len() < 10 {
            return;
        }

        let wins: Vec<f64> = sample.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = sample.iter().copied().filter(|p| *p < 0.0).collect();

        self.win_rate = wins.len() as f64 / sample.len() as f64;

        let avg_win = if wins.is_empty() {
            0.0
        } else {
            wins.iter().sum::<f64>() / wins.len() as f64
        };
        let avg_loss = if losses.is_empty() {
            0.0
        } else {
            losses.iter().map(|l| l.abs()).sum::<f64>() / losses.len() as f64
        };

        if avg_win > 0.0 && avg_loss > 0.0 {
            self.payoff_ratio = avg_win / avg_loss;
        }

        debug!(
            trades = sample.len(),
            win_rate = format!("{:.2}", self.win_rate),
            payoff = format!("{:.2}", self.payoff_ratio),
            "sizer calibrated"
        );
    }

    /// Kelly fraction, clamped to `[0, KELLY_CAP]`.
    pub fn kelly_fraction(&self) -> f64 {
        if self.payoff_ratio <= 0.0 {
            return 0.0;
        }
        let kelly = self.win_rate - (1.0 - self.win_rate) / self.payoff_ratio;
        kelly.clamp(0.0, KELLY_CAP)
    }

    /// Base quantity before regime and preservation multipliers.
    ///
    /// Confidence scales the Kelly fraction linearly from 0.5 at the entry
    /// threshold up to 1.0 at confidence 100.
    pub fn base_quantity(&self, ai_confidence: f64, price: f64, stop_loss_pct: f64) -> f64 {
        if price <= 0.0 || stop_loss_pct <= 0.0 || self.balance <= 0.0 {
            return 0.0;
        }

        let confidence_scale = 0.5 + 0.5 * ((ai_confidence - 70.0) / 30.0).clamp(0.0, 1.0);
        let risk_dollars = self.balance * self.kelly_fraction() * confidence_scale;
        let quantity = risk_dollars / (price * stop_loss_pct);

        if quantity.is_finite() {
            quantity
        } else {
            0.0
        }
    }
}

/// Regime sizing multiplier. Transitioning trends get half size like chop;
/// the cap table rewards confirmed strength.
pub fn regime_multiplier(regime: RegimeKind, is_transitioning: bool) -> f64 {
    if is_transitioning {
        return 0.5;
    }
    match regime {
        RegimeKind::Strong => 1.5,
        RegimeKind::Moderate => 1.0,
        RegimeKind::Weak => 0.75,
        RegimeKind::Transitioning => 0.5,
        RegimeKind::Choppy => 0.5,
    }
}

/// Capital-preservation multiplier: the market-wide trend gate plus per-bot
/// drawdown and loss-streak haircuts, floored at 0.25.
pub fn capital_preservation_multiplier(
    reference_trending_down: bool,
    drawdown_pct: f64,
    loss_streak: u32,
) -> f64 {
    let mut multiplier: f64 = 1.0;

    if reference_trending_down {
        multiplier *= 0.5;
    }

    if drawdown_pct >= 20.0 {
        multiplier *= 0.5;
    } else if drawdown_pct >= 10.0 {
        multiplier *= 0.75;
    }

    if loss_streak >= 5 {
        multiplier *= 0.5;
    } else if loss_streak >= 3 {
        multiplier *= 0.75;
    }

    multiplier.max(PRESERVATION_FLOOR)
}

/// Per-bot drawdown (percent) from the recent closed-trade sample: distance
/// of the running equity from its peak.
pub fn drawdown_pct(closed: &[Trade]) -> f64 {
    let mut equity = 0.0_f64;
    let mut peak = 0.0_f64;
    let mut worst = 0.0_f64;

    // Oldest first for a meaningful running curve.
    for trade in closed.iter().rev() {
        equity += trade.profit_loss.unwrap_or(0.0);
        peak = peak.max(equity);
        if peak > 0.0 {
            worst = worst.max((peak - equity) / peak * 100.0);
        }
    }
    worst
}

/// Consecutive losses at the head (newest) of the closed-trade sample.
pub fn current_loss_streak(closed: &[Trade]) -> u32 {
    let mut streak = 0;
    for trade in closed {
        match trade.profit_loss {
            Some(p) if p < 0.0 => streak += 1,
            _ => break,
        }
    }
    streak
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, TradeStatus, TradingMode};
    use chrono::Utc;

    fn closed_trade(pnl: f64) -> Trade {
        Trade {
            id: 0,
            bot_instance_id: 1,
            pair: "BTC/USD".into(),
            side: Side::Buy,
            entry_price: 100.0,
            quantity: 1.0,
            entry_time: Utc::now(),
            stop_loss: 95.0,
            take_profit: 110.0,
            fee: 0.0,
            pyramid_levels: Vec::new(),
            status: TradeStatus::Closed,
            exit_price: Some(100.0 + pnl),
            exit_time: Some(Utc::now()),
            profit_loss: Some(pnl),
            profit_loss_percent: Some(pnl),
            exit_reason: None,
            idempotency_key: String::new(),
            trading_mode: TradingMode::Paper,
        }
    }

    #[test]
    fn priors_give_positive_fraction() {
        let sizer = DynamicPositionSizer::new(10_000.0);
        let kelly = sizer.kelly_fraction();
        assert!(kelly > 0.0 && kelly <= KELLY_CAP);
    }

    #[test]
    fn calibration_needs_ten_trades() {
        let mut sizer = DynamicPositionSizer::new(10_000.0);
        let before = sizer.kelly_fraction();
        sizer.calibrate(&[closed_trade(5.0), closed_trade(-5.0)]);
        assert_eq!(sizer.kelly_fraction(), before);
    }

    #[test]
    fn losing_history_drives_fraction_to_zero() {
        let mut sizer = DynamicPositionSizer::new(10_000.0);
        let losses: Vec<Trade> = (0..20).map(|_| closed_trade(-10.0)).collect();
        sizer.calibrate(&losses);
        assert_eq!(sizer.kelly_fraction(), 0.0);
        assert_eq!(sizer.base_quantity(90.0, 100.0, 0.05), 0.0);
    }

    #[test]
    fn winning_history_caps_at_kelly_cap() {
        let mut sizer = DynamicPositionSizer::new(10_000.0);
        let wins: Vec<Trade> = (0..50).map(|_| closed_trade(10.0)).collect();
        sizer.calibrate(&wins);
        assert_eq!(sizer.kelly_fraction(), KELLY_CAP);
    }

    #[test]
    fn quantity_scales_with_confidence() {
        let sizer = DynamicPositionSizer::new(10_000.0);
        let at_threshold = sizer.base_quantity(70.0, 100.0, 0.05);
        let at_max = sizer.base_quantity(100.0, 100.0, 0.05);
        assert!(at_max > at_threshold);
        assert!((at_max / at_threshold - 2.0).abs() < 1e-9);
    }

    #[test]
    fn degenerate_inputs_give_zero() {
        let sizer = DynamicPositionSizer::new(10_000.0);
        assert_eq!(sizer.base_quantity(90.0, 0.0, 0.05), 0.0);
        assert_eq!(sizer.base_quantity(90.0, 100.0, 0.0), 0.0);
        assert_eq!(DynamicPositionSizer::new(0.0).base_quantity(90.0, 100.0, 0.05), 0.0);
    }

    #[test]
    fn regime_multiplier_table() {
        assert_eq!(regime_multiplier(RegimeKind::Strong, false), 1.5);
        assert_eq!(regime_multiplier(RegimeKind::Moderate, false), 1.0);
        assert_eq!(regime_multiplier(RegimeKind::Weak, false), 0.75);
        assert_eq!(regime_multiplier(RegimeKind::Choppy, false), 0.5);
        // The transitioning override halves size regardless of label.
        assert_eq!(regime_multiplier(RegimeKind::Strong, true), 0.5);
    }

    #[test]
    fn preservation_floor_holds() {
        let m = capital_preservation_multiplier(true, 25.0, 6);
        assert_eq!(m, PRESERVATION_FLOOR);
        assert_eq!(capital_preservation_multiplier(false, 0.0, 0), 1.0);
        assert_eq!(capital_preservation_multiplier(false, 12.0, 0), 0.75);
        assert_eq!(capital_preservation_multiplier(false, 0.0, 3), 0.75);
    }

    #[test]
    fn loss_streak_counts_newest_first() {
        let trades = vec![
            closed_trade(-1.0),
            closed_trade(-2.0),
            closed_trade(3.0),
            closed_trade(-4.0),
        ];
        assert_eq!(current_loss_streak(&trades), 2);
        assert_eq!(current_loss_streak(&[closed_trade(1.0)]), 0);
    }

    #[test]
    fn drawdown_from_equity_curve() {
        // Oldest last: +10, +10, -15 => peak 20, trough 5 => 75 % drawdown.
        let trades = vec![closed_trade(-15.0), closed_trade(10.0), closed_trade(10.0)];
        let dd = drawdown_pct(&trades);
        assert!((dd - 75.0).abs() < 1e-9);
    }
}
