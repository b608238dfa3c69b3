//! Data models for positions, market snapshots and transaction events.

mod position;
mod snapshot;
mod transaction;

pub use position::{
    AbortReason, ExitReason, Position, PositionId, PositionStatus, PriceSample, RejectionReason,
    RiskLevels,
};
pub use snapshot::{IndicatorSnapshot, Prediction};
pub use transaction::{TradeSide, TransactionAction, TransactionEvent};
