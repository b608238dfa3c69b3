//! HTTP client for the market-data / forecasting service.
//!
//! The service computes indicators from raw ticks and hosts the forecasting
//! model; this client only moves JSON. Endpoints:
//! - `GET  /snapshot/{pair}` -> [`IndicatorSnapshot`]
//! - `POST /predict`         -> `{ "predicted_price": .., "model_ready": .. }`
//! - `POST /train`

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::models::{IndicatorSnapshot, Prediction};

use super::{PricePredictor, SnapshotProvider};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Training can take much longer than a forecast.
const TRAIN_TIMEOUT: Duration = Duration::from_secs(300);

/// Client for the indicator and forecasting service.
pub struct MarketClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    pair: &'a str,
    price: Decimal,
    rsi: Decimal,
    sma: Decimal,
    bb_upper: Decimal,
    bb_lower: Decimal,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predicted_price: Option<Decimal>,
    #[serde(default = "default_true")]
    model_ready: bool,
}

#[derive(Debug, Serialize)]
struct TrainRequest<'a> {
    pair: &'a str,
}

fn default_true() -> bool {
    true
}

impl MarketClient {
    /// Create with custom base URL.
    pub fn with_base_url(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Build from `PILOT_MARKET_URL`, falling back to the local default.
    pub fn from_env() -> Result<Self> {
        let base_url =
            std::env::var("PILOT_MARKET_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::with_base_url(base_url)
    }

    fn snapshot_url(&self, pair: &str) -> String {
        format!("{}/snapshot/{}", self.base_url, pair)
    }

    async fn request_prediction(
        &self,
        pair: &str,
        snapshot: &IndicatorSnapshot,
    ) -> Result<PredictResponse> {
        let url = format!("{}/predict", self.base_url);
        let body = PredictRequest {
            pair,
            price: snapshot.price,
            rsi: snapshot.rsi,
            sma: snapshot.sma,
            bb_upper: snapshot.bb_upper,
            bb_lower: snapshot.bb_lower,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Failed to request prediction")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Prediction request failed: {} - {}", status, text);
        }

        response
            .json()
            .await
            .context("Failed to parse prediction response")
    }
}

#[async_trait]
impl SnapshotProvider for MarketClient {
    async fn fetch_snapshot(&self, pair: &str) -> Result<IndicatorSnapshot> {
        let url = self.snapshot_url(pair);
        debug!(url = %url, "Fetching snapshot");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch snapshot")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Snapshot request failed: {} - {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse snapshot response")
    }
}

#[async_trait]
impl PricePredictor for MarketClient {
    async fn train(&self, pair: &str) -> Result<()> {
        let url = format!("{}/train", self.base_url);
        info!(pair = %pair, "Requesting model training");

        let response = self
            .client
            .post(&url)
            .timeout(TRAIN_TIMEOUT)
            .json(&TrainRequest { pair })
            .send()
            .await
            .context("Failed to request training")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Training request failed: {} - {}", status, body);
        }

        Ok(())
    }

    async fn predict(&self, pair: &str, snapshot: &IndicatorSnapshot) -> Result<Prediction> {
        let mut response = self.request_prediction(pair, snapshot).await?;

        // First use on a pair: train once, then ask again.
        if !response.model_ready {
            warn!(pair = %pair, "No trained model, training before prediction");
            if let Err(e) = self.train(pair).await {
                warn!(pair = %pair, error = %e, "Training failed");
                return Ok(Prediction::Unavailable);
            }
            response = self.request_prediction(pair, snapshot).await?;
        }

        Ok(match response.predicted_price {
            Some(price) if response.model_ready => Prediction::Price(price),
            _ => Prediction::Unavailable,
        })
    }
}
