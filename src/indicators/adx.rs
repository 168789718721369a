// =============================================================================
// Average Directional Index (ADX) with slope
// =============================================================================
//
// ADX quantifies trend strength regardless of direction. The engine consumes
// both the latest value (regime classification, entry health gate) and its
// recent slope (transitioning-zone detection, trend-exhaustion votes), so the
// calculation keeps the whole smoothed series.
//
// Wilder's pipeline: +DM/-DM and True Range per bar, Wilder-smoothed over
// `period`, DI lines, DX, then a Wilder-smoothed DX average.
// =============================================================================

use crate::types::Candle;

/// Bars over which the slope is measured (per-bar average change).
const SLOPE_SPAN: usize = 3;

/// Latest ADX value and its per-bar slope over the last [`SLOPE_SPAN`] bars.
///
/// Returns `None` when there is not enough data for one smoothed value
/// (`2 * period + 1` candles) or a calculation degenerates. When the series
/// is too short for a slope, the slope is reported as `0.0`.
pub fn adx_with_slope(candles: &[Candle], period: usize) -> Option<(f64, f64)> {
    let series = adx_series(candles, period)?;
    let last = *series.last()?;

    let slope = if series.len() > SLOPE_SPAN {
        (last - series[series.len() - 1 - SLOPE_SPAN]) / SLOPE_SPAN as f64
    } else {
        0.0
    };

    Some((last, slope))
}

/// Full ADX series for the candle window (one value per bar once seeded).
pub fn adx_series(candles: &[Candle], period: usize) -> Option<Vec<f64>> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }

    let period_f = period as f64;
    let transitions = candles.len() - 1;

    // Raw directional movement and true range per bar-to-bar transition.
    let mut plus_dm = Vec::with_capacity(transitions);
    let mut minus_dm = Vec::with_capacity(transitions);
    let mut true_range = Vec::with_capacity(transitions);

    for pair in candles.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);

        let tr = (cur.high - cur.low)
            .max((cur.high - prev.close).abs())
            .max((cur.low - prev.close).abs());

        let up = cur.high - prev.high;
        let down = prev.low - cur.low;

        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
        true_range.push(tr);
    }

    // Wilder smoothing, seeded with plain sums of the first `period` bars.
    let mut sm_plus: f64 = plus_dm[..period].iter().sum();
    let mut sm_minus: f64 = minus_dm[..period].iter().sum();
    let mut sm_tr: f64 = true_range[..period].iter().sum();

    let mut dx_values = vec![directional_index(sm_plus, sm_minus, sm_tr)?];

    for i in period..transitions {
        sm_plus += plus_dm[i] - sm_plus / period_f;
        sm_minus += minus_dm[i] - sm_minus / period_f;
        sm_tr += true_range[i] - sm_tr / period_f;
        dx_values.push(directional_index(sm_plus, sm_minus, sm_tr)?);
    }

    if dx_values.len() < period {
        return None;
    }

    // ADX: SMA seed over the first `period` DX values, Wilder thereafter.
    let mut adx = dx_values[..period].iter().sum::<f64>() / period_f;
    if !adx.is_finite() {
        return None;
    }

    let mut series = vec![adx];
    for &dx in &dx_values[period..] {
        adx = (adx * (period_f - 1.0) + dx) / period_f;
        if !adx.is_finite() {
            return None;
        }
        series.push(adx);
    }

    Some(series)
}

/// DX from smoothed +DM, -DM, and TR. `None` when the true range is zero or
/// the value degenerates.
fn directional_index(sm_plus: f64, sm_minus: f64, sm_tr: f64) -> Option<f64> {
    if sm_tr == 0.0 {
        return None;
    }

    let plus_di = sm_plus / sm_tr * 100.0;
    let minus_di = sm_minus / sm_tr * 100.0;
    let di_sum = plus_di + minus_di;

    if di_sum == 0.0 {
        return Some(0.0);
    }

    let dx = (plus_di - minus_di).abs() / di_sum * 100.0;
    dx.is_finite().then_some(dx)
}
