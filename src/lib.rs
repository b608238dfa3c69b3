//! Risk-managed position lifecycle engine.
//!
//! Opens a position on a pair when the forecast and indicators agree, then
//! supervises it with stop-loss, take-profit and trailing-stop exits placed
//! through an idempotent order gateway.

pub mod api;
pub mod db;
pub mod error;
pub mod metrics;
pub mod models;
pub mod trading;

pub use error::{EngineError, GatewayError};
