// =============================================================================
// Regime Detector — per-pair ADX trend-quality classification
// =============================================================================
//
// Classification from the 100 most recent 1-hour candles:
//
//   ADX >= 40  => strong
//   ADX >= 25  => moderate
//   ADX >= 20  => weak
//   else       => choppy
//
// `transitioning` is a runtime override produced by the entry filter
// (ADX in [20, 25) with a rising slope) and never stored. Classifications
// are cached for five minutes and every detection is persisted as a
// `market_regime` row for the audit trail.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::indicators;
use crate::market_data::OhlcCache;
use crate::store::TradeStore;
use crate::types::{Regime, RegimeKind};

/// Candle window feeding the classifier.
const CANDLE_WINDOW: u32 = 100;

pub struct RegimeDetector {
    ohlc: Arc<OhlcCache>,
    store: Arc<dyn TradeStore>,
    cache_ttl: Duration,
    cache: RwLock<HashMap<String, (Regime, Instant)>>,
}

impl RegimeDetector {
    pub fn new(ohlc: Arc<OhlcCache>, store: Arc<dyn TradeStore>, cache_ttl: Duration) -> Self {
        Self {
            ohlc,
            store,
            cache_ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Cached regime for a pair, if still fresh.
    pub fn cached(&self, pair: &str) -> Option<Regime> {
        let cache = self.cache.read();
        let (regime, at) = cache.get(pair)?;
        (at.elapsed() < self.cache_ttl).then(|| regime.clone())
    }

    /// Detect the regime for one pair, consulting the cache first.
    pub async fn detect(&self, pair: &str) -> Option<Regime> {
        if let Some(regime) = self.cached(pair) {
            return Some(regime);
        }

        let candles = match self.ohlc.fetch(pair, "1h", CANDLE_WINDOW).await {
            Ok(c) => c,
            Err(e) => {
                debug!(pair, error = %e, "regime candle fetch failed");
                return None;
            }
        };

        let snapshot = match indicators::compute_snapshot(&candles) {
            Some(s) => s,
            None => {
                warn!(pair, candles = candles.len(), "insufficient data for regime detection");
                return None;
            }
        };

        let (kind, confidence, reason) = classify(snapshot.adx, snapshot.adx_slope);
        let regime = Regime {
            kind,
            confidence,
            reason,
            timestamp: Utc::now(),
        };

        debug!(
            pair,
            regime = %kind,
            adx = format!("{:.2}", snapshot.adx),
            confidence = format!("{:.2}", confidence),
            "regime detected"
        );

        if let Err(e) = self.store.insert_regime(pair, &regime).await {
            warn!(pair, error = %e, "regime row persist failed");
        }

        self.cache
            .write()
            .insert(pair.to_string(), (regime.clone(), Instant::now()));
        Some(regime)
    }

    /// Detect regimes for every pair concurrently. Pairs whose detection
    /// fails are absent from the result.
    pub async fn detect_for_all_pairs(&self, pairs: &[String]) -> HashMap<String, Regime> {
        let futures: Vec<_> = pairs
            .iter()
            .map(|pair| async move {
                let regime = self.detect(pair).await;
                (pair.clone(), regime)
            })
            .collect();

        join_all(futures)
            .await
            .into_iter()
            .filter_map(|(pair, regime)| regime.map(|r| (pair, r)))
            .collect()
    }
}

/// Classify raw ADX into a regime with a confidence score. The slope feeds
/// only the reason string; the transitioning override lives in the entry
/// filter.
fn classify(adx: f64, adx_slope: f64) -> (RegimeKind, f64, String) {
    let (kind, confidence) = if adx >= 40.0 {
        (RegimeKind::Strong, remap(adx, 40.0, 60.0, 0.70, 1.0))
    } else if adx >= 25.0 {
        (RegimeKind::Moderate, remap(adx, 25.0, 40.0, 0.55, 0.90))
    } else if adx >= 20.0 {
        (RegimeKind::Weak, remap(adx, 20.0, 25.0, 0.45, 0.70))
    } else {
        (RegimeKind::Choppy, remap(adx, 20.0, 5.0, 0.50, 0.95))
    };

    let reason = format!(
        "adx={adx:.1} slope={adx_slope:+.2} => {kind}",
    );
    (kind, confidence, reason)
}

/// Linearly remap `value` from `[in_lo, in_hi]` to `[out_lo, out_hi]`,
/// clamped to the output range.
fn remap(value: f64, in_lo: f64, in_hi: f64, out_lo: f64, out_hi: f64) -> f64 {
    let t = if (in_hi - in_lo).abs() < f64::EPSILON {
        0.5
    } else {
        ((value - in_lo) / (in_hi - in_lo)).clamp(0.0, 1.0)
    };
    out_lo + t * (out_hi - out_lo)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_table() {
        assert_eq!(classify(45.0, 0.0).0, RegimeKind::Strong);
        assert_eq!(classify(40.0, 0.0).0, RegimeKind::Strong);
        assert_eq!(classify(39.9, 0.0).0, RegimeKind::Moderate);
        assert_eq!(classify(25.0, 0.0).0, RegimeKind::Moderate);
        assert_eq!(classify(24.9, 0.0).0, RegimeKind::Weak);
        assert_eq!(classify(20.0, 0.0).0, RegimeKind::Weak);
        assert_eq!(classify(19.9, 0.0).0, RegimeKind::Choppy);
        assert_eq!(classify(5.0, 0.0).0, RegimeKind::Choppy);
    }

    #[test]
    fn confidence_bounded() {
        for adx in [0.0, 10.0, 20.0, 25.0, 33.0, 40.0, 55.0, 80.0] {
            let (_, confidence, _) = classify(adx, 0.0);
            assert!((0.0..=1.0).contains(&confidence), "confidence {confidence}");
        }
    }

    #[test]
    fn stronger_trend_scores_higher_within_band() {
        let (_, weak_conf, _) = classify(26.0, 0.0);
        let (_, strong_conf, _) = classify(38.0, 0.0);
        assert!(strong_conf > weak_conf);
    }

    #[test]
    fn reason_mentions_adx() {
        let (_, _, reason) = classify(31.2, 0.7);
        assert!(reason.contains("adx=31.2"));
        assert!(reason.contains("moderate"));
    }

    #[test]
    fn remap_clamps() {
        assert_eq!(remap(200.0, 0.0, 100.0, 0.0, 1.0), 1.0);
        assert_eq!(remap(-5.0, 0.0, 100.0, 0.0, 1.0), 0.0);
        assert!((remap(50.0, 0.0, 100.0, 0.0, 1.0) - 0.5).abs() < 1e-12);
    }
}
