//! Market snapshot and forecast types consumed by the entry gate and monitor.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Latest price for a pair plus the indicator set computed upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    /// Asset pair
    pub pair: String,

    /// Last traded price
    pub price: Decimal,

    /// RSI(14)
    pub rsi: Decimal,

    /// SMA(20)
    pub sma: Decimal,

    /// Upper Bollinger band (20, 2)
    pub bb_upper: Decimal,

    /// Lower Bollinger band (20, 2)
    pub bb_lower: Decimal,

    /// Average true range, when the provider computes it
    #[serde(default)]
    pub atr: Option<Decimal>,

    /// When the provider produced the snapshot
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl IndicatorSnapshot {
    /// Snapshot carrying only a price, for feeds that do not compute indicators.
    pub fn price_only(pair: impl Into<String>, price: Decimal) -> Self {
        Self {
            pair: pair.into(),
            price,
            rsi: Decimal::ZERO,
            sma: price,
            bb_upper: price,
            bb_lower: price,
            atr: None,
            timestamp: Utc::now(),
        }
    }
}

/// Result of asking the price predictor for a forecast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "price")]
pub enum Prediction {
    Price(Decimal),
    /// No model available, or the model could not produce a forecast.
    Unavailable,
}

impl Prediction {
    pub fn price(&self) -> Option<Decimal> {
        match self {
            Self::Price(p) => Some(*p),
            Self::Unavailable => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_snapshot_from_provider_json() {
        let json = r#"{
            "pair": "btcidr",
            "price": 400000,
            "rsi": 55.2,
            "sma": 399000.5,
            "bb_upper": 420000,
            "bb_lower": 380000
        }"#;

        let snap: IndicatorSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snap.price, dec!(400000));
        assert_eq!(snap.rsi, dec!(55.2));
        assert!(snap.atr.is_none());
        assert_eq!(snap.bb_lower, dec!(380000));
    }

    #[test]
    fn test_prediction_price() {
        assert_eq!(Prediction::Price(dec!(1.5)).price(), Some(dec!(1.5)));
        assert_eq!(Prediction::Unavailable.price(), None);
    }
}
