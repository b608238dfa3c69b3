//! Risk levels and sizing for a new position.
//!
//! Everything here is pure: given an entry price, the entry snapshot and a
//! [`RiskConfig`], derive the stop-loss and take-profit the monitor enforces.

use rust_decimal::Decimal;

use crate::error::EngineError;
use crate::models::{IndicatorSnapshot, RiskLevels};

use super::config::RiskConfig;

/// Strategy for turning an entry into exit thresholds.
pub trait RiskModel: Send + Sync {
    fn levels(
        &self,
        entry_price: Decimal,
        snapshot: &IndicatorSnapshot,
    ) -> Result<RiskLevels, EngineError>;
}

/// Stop and target at fixed fractions of the entry price.
#[derive(Debug, Clone, Copy)]
pub struct FixedRisk {
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
    pub trailing_stop_pct: Option<Decimal>,
}

impl RiskModel for FixedRisk {
    fn levels(&self, entry_price: Decimal, _: &IndicatorSnapshot) -> Result<RiskLevels, EngineError> {
        check_entry(entry_price)?;
        let stop_loss = (Decimal::ONE - self.stop_loss_pct)
            .checked_mul(entry_price)
            .ok_or_else(|| overflow("stop loss", entry_price))?;
        let take_profit = (Decimal::ONE + self.take_profit_pct)
            .checked_mul(entry_price)
            .ok_or_else(|| overflow("take profit", entry_price))?;

        ordered(
            entry_price,
            RiskLevels {
                stop_loss,
                take_profit,
                trailing_stop_pct: self.trailing_stop_pct,
            },
        )
    }
}

/// Stop and target offset from entry by multiples of ATR.
#[derive(Debug, Clone, Copy)]
pub struct VolatilityRisk {
    pub stop_loss_multiplier: Decimal,
    pub take_profit_multiplier: Decimal,
    pub trailing_stop_pct: Option<Decimal>,
}

impl RiskModel for VolatilityRisk {
    fn levels(
        &self,
        entry_price: Decimal,
        snapshot: &IndicatorSnapshot,
    ) -> Result<RiskLevels, EngineError> {
        check_entry(entry_price)?;
        let atr = snapshot.atr.ok_or(EngineError::MissingIndicator("atr"))?;
        let stop_loss = atr
            .checked_mul(self.stop_loss_multiplier)
            .and_then(|offset| entry_price.checked_sub(offset))
            .ok_or_else(|| overflow("stop loss", entry_price))?;
        let take_profit = atr
            .checked_mul(self.take_profit_multiplier)
            .and_then(|offset| entry_price.checked_add(offset))
            .ok_or_else(|| overflow("take profit", entry_price))?;

        ordered(
            entry_price,
            RiskLevels {
                stop_loss,
                take_profit,
                trailing_stop_pct: self.trailing_stop_pct,
            },
        )
    }
}

impl RiskConfig {
    /// Build the model this configuration selects.
    pub fn model(&self) -> Box<dyn RiskModel> {
        match *self {
            RiskConfig::Fixed {
                stop_loss_pct,
                take_profit_pct,
                trailing_stop_pct,
            } => Box::new(FixedRisk {
                stop_loss_pct,
                take_profit_pct,
                trailing_stop_pct,
            }),
            RiskConfig::Volatility {
                stop_loss_multiplier,
                take_profit_multiplier,
                trailing_stop_pct,
            } => Box::new(VolatilityRisk {
                stop_loss_multiplier,
                take_profit_multiplier,
                trailing_stop_pct,
            }),
        }
    }

    /// Validate and compute levels in one step.
    pub fn levels(
        &self,
        entry_price: Decimal,
        snapshot: &IndicatorSnapshot,
    ) -> Result<RiskLevels, EngineError> {
        self.validate()?;
        self.model().levels(entry_price, snapshot)
    }
}

/// Base-asset quantity bought with `capital` at `entry_price`. A quantity
/// too large to represent counts as an unusable entry price.
pub fn position_quantity(capital: Decimal, entry_price: Decimal) -> Result<Decimal, EngineError> {
    check_entry(entry_price)?;
    capital
        .checked_div(entry_price)
        .ok_or(EngineError::InvalidEntryPrice(entry_price))
}

fn check_entry(entry_price: Decimal) -> Result<(), EngineError> {
    if entry_price <= Decimal::ZERO {
        return Err(EngineError::InvalidEntryPrice(entry_price));
    }
    Ok(())
}

fn overflow(level: &str, entry_price: Decimal) -> EngineError {
    EngineError::InvalidConfig(format!("{} out of range for entry {}", level, entry_price))
}

/// Levels must bracket the entry: stop below, target above.
fn ordered(entry_price: Decimal, levels: RiskLevels) -> Result<RiskLevels, EngineError> {
    if levels.take_profit <= entry_price {
        return Err(EngineError::InvalidConfig(format!(
            "take profit {} not above entry {}",
            levels.take_profit, entry_price
        )));
    }
    if levels.stop_loss >= entry_price {
        return Err(EngineError::InvalidConfig(format!(
            "stop loss {} not below entry {}",
            levels.stop_loss, entry_price
        )));
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot(price: Decimal, atr: Option<Decimal>) -> IndicatorSnapshot {
        IndicatorSnapshot {
            atr,
            ..IndicatorSnapshot::price_only("btcidr", price)
        }
    }

    #[test]
    fn test_fixed_levels_and_quantity() {
        let config = RiskConfig::Fixed {
            stop_loss_pct: dec!(0.007),
            take_profit_pct: dec!(0.001),
            trailing_stop_pct: None,
        };
        let levels = config
            .levels(dec!(400000), &snapshot(dec!(400000), None))
            .unwrap();

        assert_eq!(levels.stop_loss, dec!(397200));
        assert_eq!(levels.take_profit, dec!(400400));
        assert_eq!(
            position_quantity(dec!(20000), dec!(400000)).unwrap(),
            dec!(0.05)
        );
    }

    #[test]
    fn test_volatility_levels_use_atr() {
        let config = RiskConfig::Volatility {
            stop_loss_multiplier: dec!(1.5),
            take_profit_multiplier: dec!(3),
            trailing_stop_pct: Some(dec!(0.01)),
        };
        let levels = config
            .levels(dec!(400000), &snapshot(dec!(400000), Some(dec!(1000))))
            .unwrap();

        assert_eq!(levels.stop_loss, dec!(398500));
        assert_eq!(levels.take_profit, dec!(403000));
        assert_eq!(levels.trailing_stop_pct, Some(dec!(0.01)));
    }

    #[test]
    fn test_volatility_without_atr() {
        let config = RiskConfig::Volatility {
            stop_loss_multiplier: dec!(1.5),
            take_profit_multiplier: dec!(3),
            trailing_stop_pct: None,
        };
        let err = config
            .levels(dec!(400000), &snapshot(dec!(400000), None))
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingIndicator("atr")));
    }

    #[test]
    fn test_levels_always_bracket_entry() {
        let configs = [
            RiskConfig::default(),
            RiskConfig::Fixed {
                stop_loss_pct: dec!(0.2),
                take_profit_pct: dec!(0.0001),
                trailing_stop_pct: Some(dec!(0.05)),
            },
            RiskConfig::Volatility {
                stop_loss_multiplier: dec!(0.5),
                take_profit_multiplier: dec!(0.5),
                trailing_stop_pct: None,
            },
        ];

        for config in configs {
            for entry in [dec!(0.0001), dec!(1), dec!(400000), dec!(987654321.123)] {
                let snap = snapshot(entry, Some(entry * dec!(0.01)));
                let levels = config.levels(entry, &snap).unwrap();
                assert!(levels.stop_loss < entry, "{:?} at {}", config, entry);
                assert!(entry < levels.take_profit, "{:?} at {}", config, entry);
            }
        }
    }

    #[test]
    fn test_zero_offsets_rejected() {
        let config = RiskConfig::Fixed {
            stop_loss_pct: Decimal::ZERO,
            take_profit_pct: dec!(0.01),
            trailing_stop_pct: None,
        };
        let err = config
            .levels(dec!(400000), &snapshot(dec!(400000), None))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn test_out_of_range_arithmetic_is_an_error() {
        assert!(matches!(
            position_quantity(dec!(100000000000000000000), dec!(0.000000001)),
            Err(EngineError::InvalidEntryPrice(_))
        ));

        let err = RiskConfig::default()
            .levels(Decimal::MAX, &snapshot(Decimal::MAX, None))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));

        let volatility = RiskConfig::Volatility {
            stop_loss_multiplier: dec!(1.5),
            take_profit_multiplier: dec!(3),
            trailing_stop_pct: None,
        };
        let err = volatility
            .levels(dec!(400000), &snapshot(dec!(400000), Some(Decimal::MAX)))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn test_non_positive_entry_price() {
        assert!(matches!(
            position_quantity(dec!(20000), Decimal::ZERO),
            Err(EngineError::InvalidEntryPrice(_))
        ));
        assert!(matches!(
            RiskConfig::default().levels(dec!(-1), &snapshot(dec!(-1), None)),
            Err(EngineError::InvalidEntryPrice(_))
        ));
    }
}
