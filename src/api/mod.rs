//! External collaborators: market data, forecasting, order routing and the
//! transaction log, plus the adapters shipped with the engine.

mod gateway_client;
mod market_client;
mod paper_gateway;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::models::{IndicatorSnapshot, Prediction, TradeSide, TransactionEvent};

pub use gateway_client::GatewayClient;
pub use market_client::MarketClient;
pub use paper_gateway::PaperGateway;

/// Source of the latest price and indicators for a pair. Called at the
/// monitoring cadence; failures are treated as transient.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn fetch_snapshot(&self, pair: &str) -> Result<IndicatorSnapshot>;
}

/// Forecasting service. Latency is opaque to the engine, which only awaits
/// `predict`; `train` is exposed for operators and for lazy first use.
#[async_trait]
pub trait PricePredictor: Send + Sync {
    async fn train(&self, pair: &str) -> Result<()>;

    async fn predict(&self, pair: &str, snapshot: &IndicatorSnapshot) -> Result<Prediction>;
}

/// Order to submit through a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub pair: String,
    pub side: TradeSide,
    pub price: Decimal,
    pub quantity: Decimal,

    /// Client-assigned id. Resubmitting the same id must never create a
    /// second order.
    pub client_order_id: String,
}

/// Gateway response for an accepted order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFill {
    pub filled: bool,
    pub filled_qty: Decimal,
    pub filled_price: Decimal,
    #[serde(default)]
    pub exchange_order_id: Option<String>,
}

/// Places orders. Implementations must honour `client_order_id`: a
/// resubmission returns the original result or `GatewayError::Duplicate`.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderFill, GatewayError>;
}

/// Append-only durable log of executed actions.
#[async_trait]
pub trait TransactionRecorder: Send + Sync {
    async fn record(&self, event: &TransactionEvent) -> Result<()>;
}
