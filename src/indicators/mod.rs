// =============================================================================
// Technical Indicators
// =============================================================================
//
// The narrow indicator set the engine itself consumes: ADX (with slope), RSI,
// rate-of-change momentum, volume ratio, and intrabar momentum. Everything is
// a pure function of recent OHLC returning `Option` so callers must handle
// insufficient data.

pub mod adx;
pub mod rsi;

use crate::types::{Candle, IndicatorSnapshot};

/// Candles required before a snapshot is attempted. Below this the data is
/// treated as a quality problem and skipped.
pub const MIN_CANDLES: usize = 30;

/// Rate of change (percent) of the last close versus `bars` candles earlier.
pub fn momentum_pct(closes: &[f64], bars: usize) -> Option<f64> {
    if bars == 0 || closes.len() <= bars {
        return None;
    }
    let last = *closes.last()?;
    let earlier = closes[closes.len() - 1 - bars];
    if earlier <= 0.0 {
        return None;
    }
    let roc = (last - earlier) / earlier * 100.0;
    roc.is_finite().then_some(roc)
}

/// Last candle's volume relative to the average of the preceding `lookback`
/// candles. 1.0 means average activity.
pub fn volume_ratio(candles: &[Candle], lookback: usize) -> Option<f64> {
    if lookback == 0 || candles.len() <= lookback {
        return None;
    }
    let last = candles.last()?.volume;
    let window = &candles[candles.len() - 1 - lookback..candles.len() - 1];
    let avg = window.iter().map(|c| c.volume).sum::<f64>() / lookback as f64;
    if avg <= 0.0 {
        return None;
    }
    let ratio = last / avg;
    ratio.is_finite().then_some(ratio)
}

/// Open-to-close move of the most recent candle, in percent.
pub fn intrabar_momentum(candles: &[Candle]) -> Option<f64> {
    let last = candles.last()?;
    if last.open <= 0.0 {
        return None;
    }
    let m = (last.close - last.open) / last.open * 100.0;
    m.is_finite().then_some(m)
}

/// Compute the full [`IndicatorSnapshot`] from 1-hour candles (oldest first).
///
/// Returns `None` when any constituent indicator cannot be computed; the
/// caller skips the pair for this cycle rather than acting on partial data.
pub fn compute_snapshot(candles_1h: &[Candle]) -> Option<IndicatorSnapshot> {
    if candles_1h.len() < MIN_CANDLES {
        return None;
    }

    let closes: Vec<f64> = candles_1h.iter().map(|c| c.close).collect();

    let (adx, adx_slope) = adx::adx_with_slope(candles_1h, 14)?;
    let rsi = rsi::latest_rsi(&closes, 14)?;
    let momentum_1h = momentum_pct(&closes, 1)?;
    let momentum_4h = momentum_pct(&closes, 4)?;
    let volume_ratio = volume_ratio(candles_1h, 20)?;
    let intrabar_momentum = intrabar_momentum(candles_1h)?;

    Some(IndicatorSnapshot {
        adx,
        adx_slope,
        rsi,
        momentum_1h,
        momentum_4h,
        volume_ratio,
        intrabar_momentum,
    })
}
