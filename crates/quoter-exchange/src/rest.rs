//! Exchange REST client.
//!
//! Covers the HTTP surface the quoting core depends on: fee rates,
//! authoritative positions and open orders, order placement (single and
//! batch), and cancellation. Every call carries a request timeout; a
//! timed-out placement must be treated as "order may exist" by callers
//! and resolved through reconciliation.

use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{
    ApiOpenOrder, ApiPosition, BatchPlaceResponse, FeeRateResponse, PlaceOrderRequest,
    PlaceOrderResponse,
};

/// Default CLOB API base URL.
const DEFAULT_BASE_URL: &str = "https://clob.polymarket.com";

/// Maximum orders per batch placement request.
pub const MAX_BATCH_SIZE: usize = 15;

/// Errors that can occur when talking to the exchange.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// HTTP request failed (includes timeouts).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error status.
    #[error("API error: status {status}, body: {body}")]
    Api { status: u16, body: String },

    /// JSON parsing failed.
    #[error("JSON parsing failed: {0}")]
    Json(String),

    /// Invalid asset ID.
    #[error("Invalid asset ID: {0}")]
    InvalidAssetId(String),

    /// Batch exceeds the per-request limit.
    #[error("Batch of {0} exceeds limit of {MAX_BATCH_SIZE}")]
    BatchTooLarge(usize),
}

impl ExchangeError {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            ExchangeError::Http(e) => e.is_timeout() || e.is_connect(),
            ExchangeError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// API credentials for the authenticated endpoints.
#[derive(Debug, Clone, Default)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
}

/// Configuration for the exchange client.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Base URL for the REST API.
    pub base_url: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// REST client for the exchange.
pub struct ExchangeClient {
    http: Client,
    base_url: String,
}

impl ExchangeClient {
    /// Create a new exchange client.
    pub fn new(config: ExchangeConfig, credentials: ApiCredentials) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in [
            ("POLY_API_KEY", &credentials.api_key),
            ("POLY_API_SECRET", &credentials.api_secret),
            ("POLY_PASSPHRASE", &credentials.api_passphrase),
        ] {
            if let Ok(v) = reqwest::header::HeaderValue::from_str(value) {
                headers.insert(name, v);
            }
        }

        let http = Client::builder()
            .timeout(config.request_timeout)
            .default_headers(headers)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http,
            base_url: config.base_url,
        }
    }

    /// Create a client against a custom base URL (tests).
    pub fn with_url(base_url: &str) -> Self {
        Self::new(
            ExchangeConfig {
                base_url: base_url.to_string(),
                ..Default::default()
            },
            ApiCredentials::default(),
        )
    }

    /// Base URL this client talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the fee rate for an asset in basis points.
    pub async fn get_fee_rate(&self, asset_id: &str) -> Result<u32, ExchangeError> {
        if asset_id.is_empty() {
            return Err(ExchangeError::InvalidAssetId(
                "asset ID cannot be empty".to_string(),
            ));
        }

        let url = format!("{}/fee-rate?asset_id={}", self.base_url, asset_id);
        debug!(url = %url, "Fetching fee rate");

        let response = self.http.get(&url).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                asset_id = %asset_id,
                status = status.as_u16(),
                body = %body,
                "Fee rate API error"
            );
            return Err(ExchangeError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: FeeRateResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::Json(format!("fee rate response: {}", e)))?;
        Ok(parsed.fee_rate_bps)
    }

    /// Fetch the authoritative position list.
    pub async fn get_positions(&self) -> Result<Vec<ApiPosition>, ExchangeError> {
        let url = format!("{}/positions", self.base_url);
        self.get_json(&url, "positions").await
    }

    /// Fetch the authoritative open-order list.
    pub async fn get_open_orders(&self) -> Result<Vec<ApiOpenOrder>, ExchangeError> {
        let url = format!("{}/open-orders", self.base_url);
        self.get_json(&url, "open orders").await
    }

    /// Place a single order.
    pub async fn place_order(
        &self,
        order: &PlaceOrderRequest,
    ) -> Result<PlaceOrderResponse, ExchangeError> {
        let url = format!("{}/order", self.base_url);
        let response = self.http.post(&url).json(order).send().await?;
        let status = response.status();

        // Rejections come back as a 200 with success=false or as a 4xx
        // with an error body; surface both as a PlaceOrderResponse so the
        // caller can classify (post-only cross vs hard error).
        if status.is_success() || status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return serde_json::from_str(&body)
                .map_err(|e| ExchangeError::Json(format!("place order response: {}", e)));
        }

        let body = response.text().await.unwrap_or_default();
        Err(ExchangeError::Api {
            status: status.as_u16(),
            body,
        })
    }

    /// Place up to [`MAX_BATCH_SIZE`] orders in one request.
    pub async fn place_orders_batch(
        &self,
        orders: &[PlaceOrderRequest],
    ) -> Result<Vec<PlaceOrderResponse>, ExchangeError> {
        if orders.len() > MAX_BATCH_SIZE {
            return Err(ExchangeError::BatchTooLarge(orders.len()));
        }
        if orders.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/orders/batch", self.base_url);
        let response = self.http.post(&url).json(orders).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: BatchPlaceResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::Json(format!("batch response: {}", e)))?;
        Ok(parsed.results)
    }

    /// Cancel a single order by ID.
    pub async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        let url = format!("{}/order/{}", self.base_url, order_id);
        let response = self.http.delete(&url).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// Cancel all orders for an asset.
    pub async fn cancel_asset(&self, asset_id: &str) -> Result<(), ExchangeError> {
        if asset_id.is_empty() {
            return Err(ExchangeError::InvalidAssetId(
                "asset ID cannot be empty".to_string(),
            ));
        }

        let url = format!("{}/orders?asset_id={}", self.base_url, asset_id);
        let response = self.http.delete(&url).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        what: &str,
    ) -> Result<T, ExchangeError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Api {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| ExchangeError::Json(format!("{} response: {}", what, e)))
    }
}
