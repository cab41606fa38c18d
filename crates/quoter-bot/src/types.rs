//! Domain types for the quoting engine.
//!
//! Orders and fills are modelled as tagged variants so the state machines
//! are exhaustively checkable; exchange status strings are mapped to the
//! enum at the edge.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use quoter_common::Side;

/// Order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Active on the book, unfilled.
    Live,
    /// Active with some quantity filled.
    Partial,
    /// Fully filled (terminal).
    Filled,
    /// Cancelled by user or system (terminal).
    Cancelled,
    /// Time-to-live expired (terminal).
    Expired,
    /// Rejected by the exchange (terminal).
    Rejected,
}

impl OrderStatus {
    /// Map an exchange status string onto the enum.
    pub fn from_exchange(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "LIVE" | "OPEN" | "PENDING" => Some(OrderStatus::Live),
            "MATCHED" | "PARTIALLY_FILLED" | "PARTIAL" => Some(OrderStatus::Partial),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELLED" | "CANCELED" => Some(OrderStatus::Cancelled),
            "EXPIRED" => Some(OrderStatus::Expired),
            "REJECTED" => Some(OrderStatus::Rejected),
            _ => None,
        }
    }

    /// Terminal states: {FILLED, CANCELLED, EXPIRED, REJECTED}.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Expired
                | OrderStatus::Rejected
        )
    }

    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Live => "LIVE",
            OrderStatus::Partial => "PARTIAL",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::Rejected => "REJECTED",
        };
        write!(f, "{}", s)
    }
}

/// A tracked order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub token_id: String,
    pub side: Side,
    pub price: Decimal,
    pub original_size: Decimal,
    pub remaining_size: Decimal,
    pub status: OrderStatus,
    /// Fee rate included in the signed payload.
    pub fee_rate_bps: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn filled_size(&self) -> Decimal {
        self.original_size - self.remaining_size
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// An executed trade from the user channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    /// Exchange trade ID; may be absent on some message shapes.
    pub trade_id: Option<String>,
    pub order_id: String,
    pub token_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    /// Fee paid; negative values are rebates.
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Fill {
    /// Stable identity: the trade ID, or a synthesized key when the
    /// exchange omits one. The synthesized form is logged so operators
    /// can reason about identity.
    pub fn key(&self) -> String {
        match &self.trade_id {
            Some(id) => id.clone(),
            None => format!(
                "{}:{}:{}",
                self.order_id,
                self.timestamp.timestamp_millis(),
                self.size
            ),
        }
    }

    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }
}

/// One side of a two-sided quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteSide {
    pub price: Decimal,
    pub size: Decimal,
}

impl QuoteSide {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// A desired two-sided quote. A missing side is suppressed (price bounds
/// or limits prevent quoting it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub token_id: String,
    pub bid: Option<QuoteSide>,
    pub ask: Option<QuoteSide>,
}

impl Quote {
    pub fn empty(token_id: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            bid: None,
            ask: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bid.is_none() && self.ask.is_none()
    }
}

/// Decision from the quote engine for one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuoteDecision {
    /// Cancel all resting quotes (momentum cooldown, stale book, halt).
    CancelAll { reason: String },
    /// Desired quote is within the hysteresis threshold of the resting one.
    Keep,
    /// Replace resting quotes with the new target.
    Replace(Quote),
}

impl QuoteDecision {
    pub fn cancel_all(reason: impl Into<String>) -> Self {
        QuoteDecision::CancelAll {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(status: OrderStatus) -> Order {
        Order {
            order_id: "ord1".to_string(),
            token_id: "token1".to_string(),
            side: Side::Buy,
            price: dec!(0.45),
            original_size: dec!(10),
            remaining_size: dec!(4),
            status,
            fee_rate_bps: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_from_exchange() {
        assert_eq!(OrderStatus::from_exchange("live"), Some(OrderStatus::Live));
        assert_eq!(OrderStatus::from_exchange("OPEN"), Some(OrderStatus::Live));
        assert_eq!(
            OrderStatus::from_exchange("MATCHED"),
            Some(OrderStatus::Partial)
        );
        assert_eq!(
            OrderStatus::from_exchange("CANCELED"),
            Some(OrderStatus::Cancelled)
        );
        assert_eq!(OrderStatus::from_exchange("bogus"), None);
    }

    #[test]
    fn test_status_terminal_set() {
        for status in [
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Expired,
            OrderStatus::Rejected,
        ] {
            assert!(status.is_terminal());
            assert!(!status.is_open());
        }
        assert!(OrderStatus::Live.is_open());
        assert!(OrderStatus::Partial.is_open());
    }

    #[test]
    fn test_order_filled_size() {
        let o = order(OrderStatus::Partial);
        assert_eq!(o.filled_size(), dec!(6));
        assert!(o.is_open());
    }

    #[test]
    fn test_fill_key_uses_trade_id() {
        let fill = Fill {
            trade_id: Some("trade-9".to_string()),
            order_id: "ord1".to_string(),
            token_id: "token1".to_string(),
            side: Side::Buy,
            price: dec!(0.50),
            size: dec!(10),
            fee: Decimal::ZERO,
            timestamp: Utc::now(),
        };
        assert_eq!(fill.key(), "trade-9");
    }

    #[test]
    fn test_fill_key_synthesized() {
        let ts = DateTime::from_timestamp_millis(1704067200000).unwrap();
        let fill = Fill {
            trade_id: None,
            order_id: "ord1".to_string(),
            token_id: "token1".to_string(),
            side: Side::Sell,
            price: dec!(0.50),
            size: dec!(7.5),
            fee: Decimal::ZERO,
            timestamp: ts,
        };
        assert_eq!(fill.key(), "ord1:1704067200000:7.5");
    }

    #[test]
    fn test_fill_notional() {
        let fill = Fill {
            trade_id: None,
            order_id: "ord1".to_string(),
            token_id: "token1".to_string(),
            side: Side::Buy,
            price: dec!(0.40),
            size: dec!(25),
            fee: Decimal::ZERO,
            timestamp: Utc::now(),
        };
        assert_eq!(fill.notional(), dec!(10));
    }

    #[test]
    fn test_quote_empty() {
        let quote = Quote::empty("token1");
        assert!(quote.is_empty());

        let quote = Quote {
            token_id: "token1".to_string(),
            bid: Some(QuoteSide::new(dec!(0.45), dec!(10))),
            ask: None,
        };
        assert!(!quote.is_empty());
    }
}
