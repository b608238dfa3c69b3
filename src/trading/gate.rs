//! Entry decision gate.
//!
//! Decides whether to open a position from the current price, the indicator
//! snapshot and the forecast. Rules are evaluated in order and the first match
//! wins. A rejection is final: the controller never trades past it.

use rust_decimal::Decimal;
use tracing::debug;

use crate::models::{IndicatorSnapshot, Prediction, RejectionReason};

use super::config::{GateConfig, GateMode};

/// Why the gate decided the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReason {
    /// Forecast above current price with confirming indicators
    PredictedIncline,
    Rejected(RejectionReason),
}

impl GateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PredictedIncline => "predicted_incline",
            Self::Rejected(reason) => reason.as_str(),
        }
    }
}

/// Gate outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryDecision {
    pub approved: bool,
    pub reason: GateReason,
}

impl EntryDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            reason: GateReason::PredictedIncline,
        }
    }

    pub fn reject(reason: RejectionReason) -> Self {
        Self {
            approved: false,
            reason: GateReason::Rejected(reason),
        }
    }

    /// The rejection reason, or `None` when approved.
    pub fn rejection(&self) -> Option<RejectionReason> {
        match self.reason {
            GateReason::Rejected(reason) => Some(reason),
            GateReason::PredictedIncline => None,
        }
    }
}

/// An entry rule set.
pub trait EntryRule: Send + Sync {
    fn evaluate(
        &self,
        current_price: Decimal,
        snapshot: &IndicatorSnapshot,
        prediction: Prediction,
    ) -> EntryDecision;
}

/// Forecast direction confirmed by RSI (and optionally SMA).
#[derive(Debug, Clone, Copy)]
pub struct PredictionRsiGate {
    config: GateConfig,
}

impl PredictionRsiGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }
}

impl EntryRule for PredictionRsiGate {
    fn evaluate(
        &self,
        current_price: Decimal,
        snapshot: &IndicatorSnapshot,
        prediction: Prediction,
    ) -> EntryDecision {
        let Some(predicted) = prediction.price() else {
            return EntryDecision::reject(RejectionReason::PredictionUnavailable);
        };

        let decision = if predicted < current_price && snapshot.rsi < self.config.downtrend_rsi {
            EntryDecision::reject(RejectionReason::PredictedDecline)
        } else if predicted > current_price
            && snapshot.rsi > self.config.uptrend_rsi
            && (!self.config.sma_confirmation || current_price > snapshot.sma)
        {
            EntryDecision::approve()
        } else {
            EntryDecision::reject(RejectionReason::AmbiguousSignal)
        };

        debug!(
            current = %current_price,
            predicted = %predicted,
            rsi = %snapshot.rsi,
            sma = %snapshot.sma,
            reason = decision.reason.as_str(),
            "Gate evaluated"
        );
        decision
    }
}

/// Forecast direction alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct PredictionOnlyGate;

impl EntryRule for PredictionOnlyGate {
    fn evaluate(&self, current_price: Decimal, _: &IndicatorSnapshot, prediction: Prediction) -> EntryDecision {
        match prediction.price() {
            None => EntryDecision::reject(RejectionReason::PredictionUnavailable),
            Some(predicted) if predicted > current_price => EntryDecision::approve(),
            Some(predicted) if predicted < current_price => {
                EntryDecision::reject(RejectionReason::PredictedDecline)
            }
            Some(_) => EntryDecision::reject(RejectionReason::AmbiguousSignal),
        }
    }
}

impl GateConfig {
    /// Build the rule set this configuration selects.
    pub fn rule(&self) -> Box<dyn EntryRule> {
        match self.mode {
            GateMode::PredictionRsi => Box::new(PredictionRsiGate::new(*self)),
            GateMode::PredictionOnly => Box::new(PredictionOnlyGate),
        }
    }
}
