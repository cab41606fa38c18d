//! WebSocket stream tasks.
//!
//! Both channels feed a single engine event queue consumed by the
//! orchestrator; the tasks own nothing but their connection.

pub mod market;
pub mod user;

use thiserror::Error;

use quoter_exchange::types::{
    BestBidAskMessage, BookMessage, LastTradePriceMessage, PriceChangeMessage,
    TickSizeChangeMessage, UserOrderMessage, UserTradeMessage,
};

/// Errors that can occur on a stream task.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("connection timeout")]
    Timeout,

    #[error("stream ended unexpectedly")]
    StreamEnded,

    #[error("engine event channel closed")]
    ChannelClosed,
}

/// Events from the public market channel.
#[derive(Debug, Clone)]
pub enum MarketStreamEvent {
    /// Full snapshot, replaces book state.
    Book(BookMessage),
    /// Incremental level updates.
    PriceChange(PriceChangeMessage),
    /// Authoritative top-of-book.
    BestBidAsk(BestBidAskMessage),
    /// Trade print, feeds momentum detection.
    LastTrade(LastTradePriceMessage),
    /// Tick size update.
    TickSizeChange(TickSizeChangeMessage),
    /// Connection (re)established.
    Connected,
    /// Connection lost; the task will reconnect with backoff.
    Disconnected(String),
}

/// Events from the authenticated user channel.
#[derive(Debug, Clone)]
pub enum UserStreamEvent {
    /// Order status update.
    Order(UserOrderMessage),
    /// Fill notification.
    Trade(UserTradeMessage),
    /// Connection (re)established and authenticated.
    Connected,
    /// Connection lost. Hard fault for the risk manager.
    Disconnected(String),
    /// Sequence numbers skipped; forces reconciliation.
    SequenceGap { expected: u64, got: u64 },
}

/// Merged event type consumed by the orchestrator.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Market(MarketStreamEvent),
    User(UserStreamEvent),
}

/// Parse one market-channel text frame into events. Frames may carry a
/// single message or an array of messages.
pub fn parse_market_frame(text: &str) -> Vec<MarketStreamEvent> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Vec::new(), // PONG and friends
    };

    match value {
        serde_json::Value::Array(items) => {
            items.into_iter().filter_map(parse_market_value).collect()
        }
        other => parse_market_value(other).into_iter().collect(),
    }
}

fn parse_market_value(value: serde_json::Value) -> Option<MarketStreamEvent> {
    let event_type = value.get("event_type")?.as_str()?.to_string();
    match event_type.as_str() {
        "book" => serde_json::from_value(value).ok().map(MarketStreamEvent::Book),
        "price_change" => serde_json::from_value(value)
            .ok()
            .map(MarketStreamEvent::PriceChange),
        "best_bid_ask" => serde_json::from_value(value)
            .ok()
            .map(MarketStreamEvent::BestBidAsk),
        "last_trade_price" => serde_json::from_value(value)
            .ok()
            .map(MarketStreamEvent::LastTrade),
        "tick_size_change" => serde_json::from_value(value)
            .ok()
            .map(MarketStreamEvent::TickSizeChange),
        _ => None,
    }
}

/// Parse one user-channel text frame. Returns events plus the highest
/// sequence number seen in the frame, where the exchange provides one.
pub fn parse_user_frame(text: &str) -> (Vec<UserStreamEvent>, Option<u64>) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return (Vec::new(), None),
    };

    let mut events = Vec::new();
    let mut max_seq = None;

    let items = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    for item in items {
        if let Some(seq) = extract_sequence(&item) {
            max_seq = Some(max_seq.map_or(seq, |m: u64| m.max(seq)));
        }
        if let Some(event) = parse_user_value(item) {
            events.push(event);
        }
    }

    (events, max_seq)
}

fn parse_user_value(value: serde_json::Value) -> Option<UserStreamEvent> {
    let event_type = value.get("event_type")?.as_str()?.to_string();
    match event_type.as_str() {
        "order" => serde_json::from_value(value).ok().map(UserStreamEvent::Order),
        "trade" => serde_json::from_value(value).ok().map(UserStreamEvent::Trade),
        _ => None,
    }
}

/// Extract a WebSocket sequence number if present in the message.
fn extract_sequence(value: &serde_json::Value) -> Option<u64> {
    for key in ["sequence", "seq", "sequence_number", "seq_num"] {
        if let Some(v) = value.get(key) {
            if let Some(n) = v.as_u64() {
                return Some(n);
            }
            if let Some(s) = v.as_str()
                && let Ok(n) = s.parse()
            {
                return Some(n);
            }
        }
    }
    None
}
