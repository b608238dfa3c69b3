//! Transaction events appended to the durable trade log.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{ExitReason, Position, PositionId};

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

/// What a log entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionAction {
    Buy,
    Sell,
    /// Every exit attempt failed. The position is still exposed.
    ExitFailed,
}

impl TransactionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::ExitFailed => "EXIT_FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            "EXIT_FAILED" => Some(Self::ExitFailed),
            _ => None,
        }
    }
}

/// One entry in the transaction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub timestamp: DateTime<Utc>,
    pub position_id: PositionId,
    pub pair: String,
    pub action: TransactionAction,

    /// Fill price (or requested price for EXIT_FAILED)
    pub price: Decimal,

    /// Base-asset quantity
    pub quantity: Decimal,

    /// Client order id sent to the gateway
    pub client_order_id: String,

    #[serde(default)]
    pub exit_reason: Option<ExitReason>,

    /// Realised P&L in quote currency, SELL only
    #[serde(default)]
    pub profit_loss: Option<Decimal>,

    /// Realised return, SELL only
    #[serde(default)]
    pub profit_loss_pct: Option<Decimal>,
}

impl TransactionEvent {
    /// BUY event for a freshly opened position.
    pub fn buy(position: &Position, price: Decimal, quantity: Decimal) -> Self {
        Self {
            timestamp: Utc::now(),
            position_id: position.id,
            pair: position.pair.clone(),
            action: TransactionAction::Buy,
            price,
            quantity,
            client_order_id: position.entry_order_id.clone(),
            exit_reason: None,
            profit_loss: None,
            profit_loss_pct: None,
        }
    }

    /// SELL event for a closed position, carrying its realised P&L.
    pub fn sell(position: &Position) -> Self {
        Self {
            timestamp: Utc::now(),
            position_id: position.id,
            pair: position.pair.clone(),
            action: TransactionAction::Sell,
            price: position.exit_price.unwrap_or_default(),
            quantity: position.exit_quantity.unwrap_or_default(),
            client_order_id: position.exit_order_id.clone(),
            exit_reason: position.exit_reason,
            profit_loss: position.realized_pnl,
            profit_loss_pct: position.realized_pnl_pct,
        }
    }

    /// Alert event for a position whose exit could not be placed.
    pub fn exit_failed(position: &Position, requested_price: Decimal) -> Self {
        Self {
            timestamp: Utc::now(),
            position_id: position.id,
            pair: position.pair.clone(),
            action: TransactionAction::ExitFailed,
            price: requested_price,
            quantity: position.quantity,
            client_order_id: position.exit_order_id.clone(),
            exit_reason: position.exit_reason,
            profit_loss: None,
            profit_loss_pct: None,
        }
    }
}
