// =============================================================================
// Signal Source — capability contract for the external signal generator
// =============================================================================
//
// The AI signal generator lives outside the engine. The orchestrator hands it
// the current price plus the indicator snapshot and receives back a trade
// signal with confidence, entry/stop/target levels, and optionally its own
// regime analysis. Stage 5 of the entry filter compares the confidence
// against the single global threshold.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::IndicatorSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalRequest {
    pub pair: String,
    pub timeframe: String,
    pub include_signal: bool,
    pub include_regime: bool,
    pub current_price: f64,
    pub indicators: IndicatorSnapshot,
}

/// Regime analysis as produced by the signal source (advisory only; the
/// engine's own classifier remains authoritative).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeAnalysis {
    pub regime: String,
    pub confidence: f64,
    pub analysis: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignalResponse {
    pub signal: SignalAction,
    pub confidence: f64,
    #[serde(default)]
    pub strength: Option<f64>,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    #[serde(default)]
    pub regime: Option<RegimeAnalysis>,
}

#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn analyze_market(&self, req: &SignalRequest) -> Result<SignalResponse>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Talks to the signal service over HTTP. One POST per consultation; the
/// orchestrator only calls after stages 1–4 of the entry filter pass, so
/// volume stays low.
pub struct HttpSignalSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSignalSource {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = api_key {
            if let Ok(val) = reqwest::header::HeaderValue::from_str(&format!("Bearer {key}")) {
                headers.insert(reqwest::header::AUTHORIZATION, val);
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SignalSource for HttpSignalSource {
    async fn analyze_market(&self, req: &SignalRequest) -> Result<SignalResponse> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(req)
            .send()
            .await
            .context("signal service request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("signal service returned {status}: {body}");
        }

        let parsed: SignalResponse = resp
            .json()
            .await
            .context("failed to parse signal response")?;

        debug!(
            pair = %req.pair,
            signal = ?parsed.signal,
            confidence = parsed.confidence,
            "signal received"
        );
        Ok(parsed)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_parses_without_optional_fields() {
        let json = r#"{
            "signal": "buy",
            "confidence": 82.5,
            "entry_price": 100000.0,
            "stop_loss": 98000.0,
            "take_profit": 104000.0
        }"#;
        let resp: SignalResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.signal, SignalAction::Buy);
        assert!(resp.strength.is_none());
        assert!(resp.regime.is_none());
    }

    #[test]
    fn response_parses_with_regime() {
        let json = r#"{
            "signal": "hold",
            "confidence": 40.0,
            "strength": 0.2,
            "entry_price": 0.0,
            "stop_loss": 0.0,
            "take_profit": 0.0,
            "regime": {
                "regime": "choppy",
                "confidence": 0.6,
                "analysis": "range-bound",
                "timestamp": 1700000000
            }
        }"#;
        let resp: SignalResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.signal, SignalAction::Hold);
        assert_eq!(resp.regime.unwrap().regime, "choppy");
    }

    #[test]
    fn request_serialises_indicator_fields() {
        let req = SignalRequest {
            pair: "BTC/USD".into(),
            timeframe: "1h".into(),
            include_signal: true,
            include_regime: true,
            current_price: 100000.0,
            indicators: IndicatorSnapshot {
                adx: 30.0,
                adx_slope: 0.5,
                rsi: 55.0,
                momentum_1h: 0.4,
                momentum_4h: 1.1,
                volume_ratio: 1.2,
                intrabar_momentum: 0.1,
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["pair"], "BTC/USD");
        assert_eq!(json["indicators"]["adx"], 30.0);
    }
}
