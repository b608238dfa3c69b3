//! Position model: one per trade, from entry decision to exit.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Unique position identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionId(Uuid);

impl PositionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Client order id for this position's order on `side`. Deterministic so
    /// that every retry of the same order carries the same id.
    pub fn client_order_id(&self, side: &str) -> String {
        format!("{}-{}", self.0.simple(), side.to_lowercase())
    }
}

impl Default for PositionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PositionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle status. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Pending,
    Open,
    Closing,
    Closed,
    Aborted,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Aborted => "aborted",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: PositionStatus) -> bool {
        use PositionStatus::*;
        matches!(
            (self, next),
            (Pending, Open)
                | (Pending, Aborted)
                | (Open, Closing)
                | (Open, Aborted)
                | (Closing, Closed)
                | (Closing, Aborted)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Aborted)
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a position is being exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    TrailingStop,
    Manual,
    Error,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TakeProfit => "take_profit",
            Self::StopLoss => "stop_loss",
            Self::TrailingStop => "trailing_stop",
            Self::Manual => "manual",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "take_profit" => Some(Self::TakeProfit),
            "stop_loss" => Some(Self::StopLoss),
            "trailing_stop" => Some(Self::TrailingStop),
            "manual" => Some(Self::Manual),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an entry was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    PredictionUnavailable,
    PredictedDecline,
    AmbiguousSignal,
    PositionAlreadyActive,
    SnapshotUnavailable,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PredictionUnavailable => "prediction_unavailable",
            Self::PredictedDecline => "predicted_decline",
            Self::AmbiguousSignal => "ambiguous_signal",
            Self::PositionAlreadyActive => "position_already_active",
            Self::SnapshotUnavailable => "snapshot_unavailable",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a position ended in `aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "reason")]
pub enum AbortReason {
    /// The entry gate refused the trade.
    Rejected(RejectionReason),
    /// Entry price was zero or negative.
    InvalidEntryPrice,
    /// Risk levels could not be derived for this entry.
    InvalidRiskLevels,
    /// The entry order never filled.
    EntryFailed,
    /// Operator cancelled the position while it was open.
    ManualCancel,
    /// Every exit attempt failed; the exposure is still live.
    ExitFailed,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(reason) => write!(f, "rejected ({})", reason),
            Self::InvalidEntryPrice => f.write_str("invalid_entry_price"),
            Self::InvalidRiskLevels => f.write_str("invalid_risk_levels"),
            Self::EntryFailed => f.write_str("entry_failed"),
            Self::ManualCancel => f.write_str("manual_cancel"),
            Self::ExitFailed => f.write_str("exit_failed"),
        }
    }
}

/// Exit thresholds fixed when the position opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskLevels {
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub trailing_stop_pct: Option<Decimal>,
}

impl RiskLevels {
    /// Trailing floor for a given high-water mark, if trailing is configured.
    pub fn trailing_floor(&self, highest_price_seen: Decimal) -> Option<Decimal> {
        self.trailing_stop_pct
            .map(|pct| highest_price_seen * (Decimal::ONE - pct))
    }

    /// Effective stop and whether the trailing floor is the binding constraint.
    pub fn effective_stop(&self, highest_price_seen: Decimal) -> (Decimal, bool) {
        match self.trailing_floor(highest_price_seen) {
            Some(floor) if floor > self.stop_loss => (floor, true),
            _ => (self.stop_loss, false),
        }
    }
}

/// A price observed while monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSample {
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
}

/// A single trade on one pair, owned by its controller and monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,

    /// Asset pair, e.g. "btcidr"
    pub pair: String,

    /// Quote-currency amount committed to the trade
    pub capital: Decimal,

    /// Decision price at entry
    pub entry_price: Decimal,

    /// Base-asset amount held
    pub quantity: Decimal,

    /// Stop-loss / take-profit / trailing configuration
    pub levels: Option<RiskLevels>,

    /// High-water mark since the monitor started
    pub highest_price_seen: Decimal,

    pub status: PositionStatus,
    pub exit_reason: Option<ExitReason>,
    pub abort_reason: Option<AbortReason>,

    /// Set when an unclosed exposure needs an operator
    #[serde(default)]
    pub needs_intervention: bool,

    pub entry_order_id: String,
    pub exit_order_id: String,

    /// Realised exit fill
    pub exit_price: Option<Decimal>,
    pub exit_quantity: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub realized_pnl_pct: Option<Decimal>,

    pub created_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,

    /// Samples collected while monitoring. Diagnostics only.
    #[serde(default)]
    pub price_history: Vec<PriceSample>,
}

impl Position {
    /// Create a pending position for an entry that has not been decided yet.
    pub fn pending(pair: impl Into<String>, capital: Decimal) -> Self {
        let id = PositionId::new();
        Self {
            id,
            pair: pair.into(),
            capital,
            entry_price: Decimal::ZERO,
            quantity: Decimal::ZERO,
            levels: None,
            highest_price_seen: Decimal::ZERO,
            status: PositionStatus::Pending,
            exit_reason: None,
            abort_reason: None,
            needs_intervention: false,
            entry_order_id: id.client_order_id("buy"),
            exit_order_id: id.client_order_id("sell"),
            exit_price: None,
            exit_quantity: None,
            realized_pnl: None,
            realized_pnl_pct: None,
            created_at: Utc::now(),
            opened_at: None,
            closed_at: None,
            price_history: Vec::new(),
        }
    }

    fn transition(&mut self, next: PositionStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// `pending -> open`. Entry fields are fixed from here on.
    pub fn open(
        &mut self,
        entry_price: Decimal,
        quantity: Decimal,
        levels: RiskLevels,
    ) -> Result<(), EngineError> {
        self.transition(PositionStatus::Open)?;
        self.entry_price = entry_price;
        self.quantity = quantity;
        self.levels = Some(levels);
        self.highest_price_seen = entry_price;
        self.opened_at = Some(Utc::now());
        Ok(())
    }

    /// `open -> closing`, recording the exit reason exactly once.
    pub fn begin_closing(&mut self, reason: ExitReason) -> Result<(), EngineError> {
        self.transition(PositionStatus::Closing)?;
        self.exit_reason = Some(reason);
        Ok(())
    }

    /// `closing -> closed` with the realised fill.
    pub fn close(&mut self, exit_price: Decimal, exit_quantity: Decimal) -> Result<(), EngineError> {
        self.transition(PositionStatus::Closed)?;
        let pnl = (exit_price - self.entry_price) * exit_quantity;
        self.exit_price = Some(exit_price);
        self.exit_quantity = Some(exit_quantity);
        self.realized_pnl = Some(pnl);
        if !self.entry_price.is_zero() {
            self.realized_pnl_pct = Some((exit_price - self.entry_price) / self.entry_price);
        }
        self.closed_at = Some(Utc::now());
        Ok(())
    }

    /// Move to `aborted` from any non-terminal status.
    pub fn abort(&mut self, reason: AbortReason) -> Result<(), EngineError> {
        self.transition(PositionStatus::Aborted)?;
        self.abort_reason = Some(reason);
        self.needs_intervention = matches!(reason, AbortReason::ExitFailed);
        self.closed_at = Some(Utc::now());
        Ok(())
    }

    /// Record a monitored price. Returns the updated high-water mark.
    pub fn observe_price(&mut self, timestamp: DateTime<Utc>, price: Decimal) -> Decimal {
        self.price_history.push(PriceSample { timestamp, price });
        if price > self.highest_price_seen {
            self.highest_price_seen = price;
        }
        self.highest_price_seen
    }

    /// Mark-to-market P&L at `price` while the position is held.
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.quantity
    }
}
