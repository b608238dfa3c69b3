//! Engine configuration.
//!
//! Defaults mirror the values the bot has always traded with; `from_env`
//! overlays `PILOT_*` variables (a `.env` file is loaded by the binary).

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// How stop-loss and take-profit levels are derived from the entry price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum RiskConfig {
    /// Fixed fractions of the entry price.
    Fixed {
        stop_loss_pct: Decimal,
        take_profit_pct: Decimal,
        #[serde(default)]
        trailing_stop_pct: Option<Decimal>,
    },
    /// Offsets scaled by the entry snapshot's ATR.
    Volatility {
        stop_loss_multiplier: Decimal,
        take_profit_multiplier: Decimal,
        #[serde(default)]
        trailing_stop_pct: Option<Decimal>,
    },
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self::Fixed {
            stop_loss_pct: dec!(0.005),   // 0.5% below entry
            take_profit_pct: dec!(0.005), // 0.5% above entry
            trailing_stop_pct: None,
        }
    }
}

impl RiskConfig {
    pub fn trailing_stop_pct(&self) -> Option<Decimal> {
        match self {
            Self::Fixed {
                trailing_stop_pct, ..
            }
            | Self::Volatility {
                trailing_stop_pct, ..
            } => *trailing_stop_pct,
        }
    }

    /// Sign and range checks that do not need an entry price.
    pub fn validate(&self) -> Result<(), EngineError> {
        let (name_sl, sl, name_tp, tp) = match self {
            Self::Fixed {
                stop_loss_pct,
                take_profit_pct,
                ..
            } => ("stop_loss_pct", *stop_loss_pct, "take_profit_pct", *take_profit_pct),
            Self::Volatility {
                stop_loss_multiplier,
                take_profit_multiplier,
                ..
            } => (
                "stop_loss_multiplier",
                *stop_loss_multiplier,
                "take_profit_multiplier",
                *take_profit_multiplier,
            ),
        };

        if sl < Decimal::ZERO {
            return Err(EngineError::InvalidConfig(format!("{} is negative: {}", name_sl, sl)));
        }
        if tp < Decimal::ZERO {
            return Err(EngineError::InvalidConfig(format!("{} is negative: {}", name_tp, tp)));
        }
        if let Some(trail) = self.trailing_stop_pct() {
            if trail <= Decimal::ZERO || trail >= Decimal::ONE {
                return Err(EngineError::InvalidConfig(format!(
                    "trailing_stop_pct must be in (0, 1), got {}",
                    trail
                )));
            }
        }
        Ok(())
    }
}

/// Which entry rule set to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    /// Forecast direction confirmed by RSI.
    PredictionRsi,
    /// Forecast direction alone.
    PredictionOnly,
}

impl FromStr for GateMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "prediction_rsi" | "rsi" => Ok(Self::PredictionRsi),
            "prediction_only" | "prediction" => Ok(Self::PredictionOnly),
            other => anyhow::bail!("Unknown gate mode: {}", other),
        }
    }
}

/// Entry gate thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    pub mode: GateMode,

    /// Reject a forecast decline when RSI is below this
    pub downtrend_rsi: Decimal,

    /// Approve a forecast rise when RSI is above this
    pub uptrend_rsi: Decimal,

    /// Additionally require price above SMA before approving
    pub sma_confirmation: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            mode: GateMode::PredictionRsi,
            downtrend_rsi: dec!(40),
            uptrend_rsi: dec!(50),
            sma_confirmation: false,
        }
    }
}

impl GateConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        let range = Decimal::ZERO..=dec!(100);
        if !range.contains(&self.downtrend_rsi) || !range.contains(&self.uptrend_rsi) {
            return Err(EngineError::InvalidConfig(
                "RSI thresholds must be within 0..=100".to_string(),
            ));
        }
        if self.downtrend_rsi > self.uptrend_rsi {
            return Err(EngineError::InvalidConfig(format!(
                "downtrend_rsi {} above uptrend_rsi {}",
                self.downtrend_rsi, self.uptrend_rsi
            )));
        }
        Ok(())
    }
}

/// Price monitoring cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Sampling interval in milliseconds
    pub poll_interval_ms: u64,

    /// Consecutive feed failures tolerated before exiting with `error`
    pub max_feed_failures: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            max_feed_failures: 5,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Retry policy for entry and exit orders.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitConfig {
    /// Total submissions per order, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ExitConfig {
    /// Exponential backoff bounded by attempt count, not elapsed time.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_backoff_ms))
            .with_max_interval(Duration::from_millis(self.max_backoff_ms))
            .with_multiplier(self.backoff_multiplier)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Bounds on how long the engine waits for the transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderConfig {
    pub max_attempts: u32,
    pub timeout_ms: u64,
    pub backoff_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_ms: 2_000,
            backoff_ms: 200,
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default pair to trade
    pub pair: String,

    /// Default quote-currency capital per position
    pub capital: Decimal,

    pub risk: RiskConfig,
    pub gate: GateConfig,
    pub monitor: MonitorConfig,
    pub exit: ExitConfig,
    pub recorder: RecorderConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pair: "btcidr".to_string(),
            capital: dec!(20000),
            risk: RiskConfig::default(),
            gate: GateConfig::default(),
            monitor: MonitorConfig::default(),
            exit: ExitConfig::default(),
            recorder: RecorderConfig::default(),
        }
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", key, e)),
        Err(_) => Ok(None),
    }
}

impl EngineConfig {
    /// Defaults overlaid with `PILOT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(pair) = env_parse::<String>("PILOT_PAIR")? {
            config.pair = pair;
        }
        if let Some(capital) = env_parse("PILOT_CAPITAL")? {
            config.capital = capital;
        }

        let trailing = env_parse::<Decimal>("PILOT_TRAILING_STOP_PCT")?;
        let mode = env_parse::<String>("PILOT_RISK_MODE")?.unwrap_or_else(|| "fixed".to_string());
        config.risk = match mode.as_str() {
            "fixed" => {
                let (default_sl, default_tp) = match config.risk {
                    RiskConfig::Fixed {
                        stop_loss_pct,
                        take_profit_pct,
                        ..
                    } => (stop_loss_pct, take_profit_pct),
                    RiskConfig::Volatility { .. } => (dec!(0.005), dec!(0.005)),
                };
                RiskConfig::Fixed {
                    stop_loss_pct: env_parse("PILOT_STOP_LOSS_PCT")?.unwrap_or(default_sl),
                    take_profit_pct: env_parse("PILOT_TAKE_PROFIT_PCT")?.unwrap_or(default_tp),
                    trailing_stop_pct: trailing,
                }
            }
            "volatility" | "atr" => RiskConfig::Volatility {
                stop_loss_multiplier: env_parse("PILOT_STOP_LOSS_ATR_MULT")?
                    .unwrap_or(dec!(1.5)),
                take_profit_multiplier: env_parse("PILOT_TAKE_PROFIT_ATR_MULT")?
                    .unwrap_or(dec!(3)),
                trailing_stop_pct: trailing,
            },
            other => anyhow::bail!("Unknown PILOT_RISK_MODE: {}", other),
        };

        if let Some(mode) = env_parse::<GateMode>("PILOT_GATE_MODE")? {
            config.gate.mode = mode;
        }
        if let Some(rsi) = env_parse("PILOT_DOWNTREND_RSI")? {
            config.gate.downtrend_rsi = rsi;
        }
        if let Some(rsi) = env_parse("PILOT_UPTREND_RSI")? {
            config.gate.uptrend_rsi = rsi;
        }
        if let Some(confirm) = env_parse("PILOT_SMA_CONFIRMATION")? {
            config.gate.sma_confirmation = confirm;
        }
        if let Some(ms) = env_parse("PILOT_POLL_INTERVAL_MS")? {
            config.monitor.poll_interval_ms = ms;
        }
        if let Some(n) = env_parse("PILOT_MAX_FEED_FAILURES")? {
            config.monitor.max_feed_failures = n;
        }
        if let Some(n) = env_parse("PILOT_EXIT_MAX_ATTEMPTS")? {
            config.exit.max_attempts = n;
        }

        config.validate().context("Invalid engine configuration")?;
        Ok(config)
    }

    /// Validate everything that can be checked before trading.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.capital <= Decimal::ZERO {
            return Err(EngineError::InvalidConfig(format!(
                "capital must be positive, got {}",
                self.capital
            )));
        }
        self.risk.validate()?;
        self.gate.validate()?;
        if self.monitor.poll_interval_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.exit.max_attempts == 0 || self.recorder.max_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "retry attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
