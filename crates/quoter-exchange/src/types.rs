//! Wire types for the exchange WebSocket channels and REST API.
//!
//! Inbound message fields arrive as strings and are parsed into
//! `Decimal` at the edge; outbound payloads serialize decimals as
//! strings to preserve tick precision.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ============================================================================
// Market channel (public)
// ============================================================================

/// Generic message for detecting event type.
#[derive(Debug, Deserialize)]
pub struct GenericMessage {
    pub event_type: Option<String>,
}

/// Subscription message to the market WebSocket.
#[derive(Debug, Serialize)]
pub struct SubscribeMessage {
    pub assets_ids: Vec<String>,
    #[serde(rename = "type")]
    pub msg_type: &'static str,
}

/// Dynamic subscription operation on an open connection.
#[derive(Debug, Serialize)]
pub struct SubscriptionOp {
    pub assets_ids: Vec<String>,
    pub operation: &'static str,
}

/// Orderbook level from the market channel.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderSummary {
    pub price: String,
    pub size: String,
}

/// Full orderbook snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct BookMessage {
    pub event_type: String,
    pub asset_id: String,
    pub market: String,
    pub timestamp: String,
    #[serde(default)]
    pub hash: Option<String>,
    pub bids: Vec<OrderSummary>,
    pub asks: Vec<OrderSummary>,
    #[serde(default)]
    pub min_tick_size: Option<String>,
}

/// Single level change inside a price_change message.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceChange {
    #[serde(default)]
    pub asset_id: Option<String>,
    pub price: String,
    pub size: String,
    pub side: String,
}

/// Incremental book update.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceChangeMessage {
    pub event_type: String,
    pub asset_id: String,
    pub market: String,
    pub timestamp: String,
    #[serde(default, alias = "changes")]
    pub price_changes: Vec<PriceChange>,
}

/// One side of a best_bid_ask update.
#[derive(Debug, Clone, Deserialize)]
pub struct TopLevel {
    pub price: String,
    pub size: String,
}

/// Authoritative top-of-book update. Preferred input for quote decisions.
#[derive(Debug, Clone, Deserialize)]
pub struct BestBidAskMessage {
    pub event_type: String,
    pub asset_id: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub best_bid: Option<TopLevel>,
    #[serde(default)]
    pub best_ask: Option<TopLevel>,
}

/// Last trade price update, feed for momentum detection.
#[derive(Debug, Clone, Deserialize)]
pub struct LastTradePriceMessage {
    pub event_type: String,
    pub asset_id: String,
    pub price: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Tick size update. Can change mid-session and affects all later quotes.
#[derive(Debug, Clone, Deserialize)]
pub struct TickSizeChangeMessage {
    pub event_type: String,
    pub asset_id: String,
    pub min_tick_size: String,
}

// ============================================================================
// User channel (authenticated)
// ============================================================================

/// Authentication block for the user channel subscription.
#[derive(Debug, Serialize)]
pub struct UserAuth {
    #[serde(rename = "apiKey")]
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

/// Subscription message for the user channel.
#[derive(Debug, Serialize)]
pub struct UserSubscribeMessage {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub auth: UserAuth,
}

/// Order status update from the user channel.
#[derive(Debug, Clone, Deserialize)]
pub struct UserOrderMessage {
    pub event_type: String,
    #[serde(alias = "order_id")]
    pub id: String,
    pub asset_id: String,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default, alias = "size")]
    pub original_size: Option<String>,
    #[serde(default)]
    pub size_matched: Option<String>,
    #[serde(default)]
    pub remaining_size: Option<String>,
    pub status: String,
    #[serde(default)]
    pub fee_rate_bps: Option<String>,
}

/// Fill notification from the user channel.
#[derive(Debug, Clone, Deserialize)]
pub struct UserTradeMessage {
    pub event_type: String,
    /// Trade ID. May be absent; callers synthesize a stable key then.
    #[serde(default, alias = "trade_id")]
    pub id: Option<String>,
    pub asset_id: String,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    pub price: String,
    pub size: String,
    #[serde(default)]
    pub fee: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

// ============================================================================
// REST payloads
// ============================================================================

/// Response from GET /fee-rate.
#[derive(Debug, Clone, Deserialize)]
pub struct FeeRateResponse {
    /// Fee rate in basis points (1 bps = 0.01%).
    #[serde(alias = "feeRateBps", alias = "fee_rate_bps", alias = "base_fee")]
    pub fee_rate_bps: u32,
}

impl FeeRateResponse {
    /// Returns the fee rate as a decimal multiplier (e.g., 0.10 for 1000 bps).
    pub fn as_decimal(&self) -> Decimal {
        Decimal::new(self.fee_rate_bps as i64, 4)
    }

    /// Returns true if this market has fees enabled.
    pub fn has_fees(&self) -> bool {
        self.fee_rate_bps > 0
    }
}

/// Authoritative position from GET /positions.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiPosition {
    #[serde(alias = "token_id")]
    pub asset_id: String,
    pub size: String,
    #[serde(default)]
    pub avg_price: Option<String>,
}

/// Authoritative open order from GET /open-orders.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiOpenOrder {
    #[serde(alias = "id")]
    pub order_id: String,
    #[serde(alias = "token_id")]
    pub asset_id: String,
    pub side: String,
    pub price: String,
    #[serde(alias = "original_size")]
    pub size: String,
    #[serde(default)]
    pub remaining_size: Option<String>,
    pub status: String,
}

/// Order placement payload for POST /order and POST /orders/batch.
#[derive(Debug, Clone, Serialize)]
pub struct PlaceOrderRequest {
    pub asset_id: String,
    pub side: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
    pub post_only: bool,
    #[serde(rename = "feeRateBps")]
    pub fee_rate_bps: u32,
    pub client_order_id: String,
}

/// Placement result for a single order.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaceOrderResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default, alias = "orderID", alias = "id")]
    pub order_id: Option<String>,
    #[serde(default, alias = "errorMsg")]
    pub error_msg: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Batch placement response.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchPlaceResponse {
    pub results: Vec<PlaceOrderResponse>,
}
