//! Error taxonomy for the position engine.
//!
//! Adapters (HTTP clients, database) report failures through `anyhow`; the
//! engine translates them into the variants below at its boundary.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{PositionId, PositionStatus, RejectionReason};

/// Errors surfaced by the engine to its callers.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Risk or gate configuration is unusable. Raised before any side effect.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Entry price is zero or negative, so no quantity can be derived.
    #[error("entry price must be positive, got {0}")]
    InvalidEntryPrice(Decimal),

    /// The selected risk model needs an indicator the snapshot did not carry.
    #[error("indicator snapshot is missing {0}")]
    MissingIndicator(&'static str),

    /// The entry was refused. `position_id` is set when a pending position had
    /// already been created (and is now `aborted`).
    #[error("entry rejected: {reason}")]
    Rejected {
        position_id: Option<PositionId>,
        reason: RejectionReason,
    },

    /// The entry BUY never filled. The position is `aborted`; nothing is held.
    #[error("entry order for position {position_id} failed: {reason}")]
    EntryFailed {
        position_id: PositionId,
        reason: String,
    },

    /// Cancelled while the entry was still being decided.
    #[error("position {0} was cancelled before entry")]
    Cancelled(PositionId),

    #[error("position {0} not found")]
    NotFound(PositionId),

    #[error("illegal status transition {from} -> {to}")]
    InvalidTransition {
        from: PositionStatus,
        to: PositionStatus,
    },

    /// An operation was requested in a state that does not accept it.
    #[error("position {id} is {status}")]
    NotActive {
        id: PositionId,
        status: PositionStatus,
    },
}

impl EngineError {
    /// Shorthand for a rejection that carries the aborted position.
    pub fn rejected(position_id: Option<PositionId>, reason: RejectionReason) -> Self {
        Self::Rejected {
            position_id,
            reason,
        }
    }

    /// The rejection reason, if this error is a rejection.
    pub fn rejection_reason(&self) -> Option<RejectionReason> {
        match self {
            Self::Rejected { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// Failure reported by an order gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Timeout, 5xx or unconfirmed response. Safe to resubmit with the same
    /// client order id.
    #[error("transient gateway failure: {0}")]
    Transient(String),

    /// The exchange refused the order. Resubmitting will not help.
    #[error("order rejected: {0}")]
    Rejected(String),

    /// An order with this client order id was already accepted.
    #[error("duplicate client order id {0}")]
    Duplicate(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
