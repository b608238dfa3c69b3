//! Simulated order gateway for paper trading.
//!
//! Orders fill immediately at the requested price adjusted by a fixed
//! slippage. Fills are remembered by client order id, so a resubmission
//! returns the original fill exactly like a well-behaved exchange gateway.

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::GatewayError;
use crate::models::TradeSide;

use super::{OrderFill, OrderGateway, OrderRequest};

/// In-memory gateway used by `simulate` and by tests.
pub struct PaperGateway {
    /// Adverse price move applied to every fill (0.0 to 1.0)
    slippage: Decimal,
    fills: RwLock<HashMap<String, OrderFill>>,
}

impl PaperGateway {
    pub fn new(slippage: Decimal) -> Self {
        Self {
            slippage,
            fills: RwLock::new(HashMap::new()),
        }
    }

    /// Number of distinct orders filled so far.
    pub async fn order_count(&self) -> usize {
        self.fills.read().await.len()
    }

    fn fill_price(&self, side: TradeSide, price: Decimal) -> Decimal {
        match side {
            TradeSide::Buy => price * (Decimal::ONE + self.slippage),
            TradeSide::Sell => price * (Decimal::ONE - self.slippage),
        }
    }
}

impl Default for PaperGateway {
    fn default() -> Self {
        Self::new(Decimal::ZERO)
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderFill, GatewayError> {
        if order.quantity <= Decimal::ZERO || order.price <= Decimal::ZERO {
            return Err(GatewayError::Rejected(format!(
                "invalid order: price {} quantity {}",
                order.price, order.quantity
            )));
        }

        let mut fills = self.fills.write().await;
        if let Some(existing) = fills.get(&order.client_order_id) {
            return Ok(existing.clone());
        }

        let fill = OrderFill {
            filled: true,
            filled_qty: order.quantity,
            filled_price: self.fill_price(order.side, order.price),
            exchange_order_id: Some(format!("paper-{}", fills.len() + 1)),
        };
        fills.insert(order.client_order_id.clone(), fill.clone());

        info!(
            pair = %order.pair,
            side = order.side.as_str(),
            price = %fill.filled_price,
            quantity = %fill.filled_qty,
            "[PAPER] Order filled"
        );

        Ok(fill)
    }
}
