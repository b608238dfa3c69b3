//! HTTP client for the external order gateway.
//!
//! Exchange signing and transport live behind the gateway; this client posts
//! orders with a client-assigned id and maps HTTP outcomes onto
//! [`GatewayError`] so the engine knows whether a resubmission is safe.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::error::GatewayError;

use super::{OrderFill, OrderGateway, OrderRequest};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const API_KEY_HEADER: &str = "X-Api-Key";

/// Order gateway reached over HTTP.
pub struct GatewayClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl GatewayClient {
    /// Create a new gateway client.
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Create from `PILOT_GATEWAY_URL` and `PILOT_GATEWAY_KEY`.
    pub fn from_env() -> Result<Self> {
        let base_url =
            std::env::var("PILOT_GATEWAY_URL").context("PILOT_GATEWAY_URL not set")?;
        let api_key = std::env::var("PILOT_GATEWAY_KEY").context("PILOT_GATEWAY_KEY not set")?;

        Self::new(&base_url, &api_key)
    }

    fn orders_url(&self) -> String {
        format!("{}/orders", self.base_url)
    }
}

/// Map a non-success HTTP status onto the gateway error taxonomy.
fn classify_failure(status: StatusCode, body: String, client_order_id: &str) -> GatewayError {
    match status {
        StatusCode::CONFLICT => GatewayError::Duplicate(client_order_id.to_string()),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            GatewayError::Transient(format!("{} - {}", status, body))
        }
        s if s.is_server_error() => GatewayError::Transient(format!("{} - {}", status, body)),
        _ => GatewayError::Rejected(format!("{} - {}", status, body)),
    }
}

#[async_trait]
impl OrderGateway for GatewayClient {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderFill, GatewayError> {
        debug!(
            pair = %order.pair,
            side = order.side.as_str(),
            price = %order.price,
            quantity = %order.quantity,
            client_order_id = %order.client_order_id,
            "Submitting order"
        );

        // Transport failures leave the outcome unknown; the client order id
        // makes a resubmission safe.
        let resp = self
            .http
            .post(self.orders_url())
            .header(API_KEY_HEADER, &self.api_key)
            .json(order)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let err = classify_failure(status, text, &order.client_order_id);
            warn!(client_order_id = %order.client_order_id, error = %err, "Order not accepted");
            return Err(err);
        }

        resp.json()
            .await
            .map_err(|e| GatewayError::Transient(format!("unreadable order response: {}", e)))
    }
}
