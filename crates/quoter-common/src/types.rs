//! Shared types for the active quoting engine.
//!
//! CRITICAL: All prices and quantities use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

use chrono::{DateTime, Utc};
use clickhouse::Row;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side for trading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Markout sign convention: favorable mid moves are positive.
    pub fn markout_sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" | "BID" => Ok(Side::Buy),
            "SELL" | "ASK" => Ok(Side::Sell),
            _ => Err(format!("Unknown side: {}", s)),
        }
    }
}

/// A single level in an order book (price + quantity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Price in USDC (0.00 to 1.00 for outcome shares).
    pub price: Decimal,
    /// Quantity available at this price.
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Persisted position snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct PositionRow {
    /// Token ID the position is in.
    pub token_id: String,
    /// Signed share count (longs only in practice).
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
    /// Average entry price.
    #[serde(with = "rust_decimal::serde::str")]
    pub avg_price: Decimal,
    /// When this snapshot was taken.
    pub updated_at: DateTime<Utc>,
}

/// Persisted fill record.
#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct FillRow {
    /// Trade ID or synthesized key.
    pub fill_id: String,
    /// Token ID.
    pub token_id: String,
    /// BUY or SELL.
    pub side: String,
    /// Fill price.
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    /// Fill size in shares.
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
    /// Fee paid (negative = rebate).
    #[serde(with = "rust_decimal::serde::str")]
    pub fee: Decimal,
    /// Mid price at fill time.
    #[serde(with = "rust_decimal::serde::str")]
    pub mid_at_fill: Decimal,
    /// Fill timestamp.
    pub ts: DateTime<Utc>,
}

/// Persisted markout sample.
#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct MarkoutRow {
    /// The fill this sample belongs to.
    pub fill_id: String,
    /// Horizon in seconds (1, 5, 15, 30, 60).
    pub horizon_s: u16,
    /// Mid price at the horizon.
    #[serde(with = "rust_decimal::serde::str")]
    pub mid: Decimal,
    /// Signed markout in basis points (favorable = positive).
    #[serde(with = "rust_decimal::serde::str")]
    pub markout_bps: Decimal,
    /// When the sample was captured.
    pub captured_at: DateTime<Utc>,
}

/// Persisted session record.
#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct SessionRow {
    /// Unique session ID.
    pub session_id: String,
    /// Session start time.
    pub started_at: DateTime<Utc>,
    /// Session end time (equal to started_at while running).
    pub ended_at: DateTime<Utc>,
    /// JSON snapshot of the effective configuration.
    pub config_snapshot: String,
    /// running | completed | halted.
    pub status: String,
}

/// Append-only ledger event.
#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct LedgerRow {
    /// Monotonic per-process sequence number.
    pub seq: u64,
    /// Session the event belongs to.
    pub session_id: String,
    /// Event timestamp.
    pub ts: DateTime<Utc>,
    /// Event kind (fill, order, risk_state, lifecycle, ...).
    pub kind: String,
    /// Token ID, empty for global events.
    pub token_id: String,
    /// JSON payload.
    pub payload: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_side_from_str() {
        assert_eq!("buy".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("ASK".parse::<Side>().unwrap(), Side::Sell);
        assert!("hold".parse::<Side>().is_err());
    }

    #[test]
    fn test_side_markout_sign() {
        assert_eq!(Side::Buy.markout_sign(), Decimal::ONE);
        assert_eq!(Side::Sell.markout_sign(), Decimal::NEGATIVE_ONE);
    }

    #[test]
    fn test_price_level() {
        let level = PriceLevel::new(dec!(0.45), dec!(100));
        assert_eq!(level.price, dec!(0.45));
        assert_eq!(level.size, dec!(100));
    }

    #[test]
    fn test_side_serde_uppercase() {
        let json = serde_json::to_string(&Side::Buy).unwrap();
        assert_eq!(json, "\"BUY\"");
        let side: Side = serde_json::from_str("\"SELL\"").unwrap();
        assert_eq!(side, Side::Sell);
    }
}
