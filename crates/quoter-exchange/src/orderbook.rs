//! Orderbook state management.
//!
//! Maintains in-memory orderbook state from WebSocket updates. Levels are
//! kept ordered (bids descending, asks ascending) so top-of-book reads are
//! index lookups.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use quoter_common::{PriceLevel, Side};

use crate::types::{BestBidAskMessage, BookMessage};

/// Default tick size until the feed reports one.
const DEFAULT_TICK_SIZE: Decimal = dec!(0.01);

/// Authoritative top-of-book for quote decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopOfBook {
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub tick_size: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl TopOfBook {
    /// Spread in whole ticks.
    pub fn spread_ticks(&self) -> i64 {
        if self.tick_size <= Decimal::ZERO {
            return 0;
        }
        ((self.best_ask - self.best_bid) / self.tick_size)
            .round()
            .try_into()
            .unwrap_or(0)
    }

    pub fn mid_price(&self) -> Decimal {
        (self.best_bid + self.best_ask) / dec!(2)
    }
}

/// In-memory orderbook state for a single token.
#[derive(Debug, Clone)]
pub struct OrderBookState {
    /// Token ID.
    pub token_id: String,
    /// Bid levels, descending by price.
    pub bids: Vec<PriceLevel>,
    /// Ask levels, ascending by price.
    pub asks: Vec<PriceLevel>,
    /// Minimum price increment. Can change mid-session.
    pub tick_size: Decimal,
    /// Last trade price seen on the feed.
    pub last_trade_price: Option<Decimal>,
    /// Last update timestamp.
    pub last_update: Option<DateTime<Utc>>,
    /// A book is synced once a full snapshot has been applied. Reconnects
    /// clear the flag; top-of-book is not served until the next snapshot.
    synced: bool,
}

impl OrderBookState {
    /// Create a new, unsynced orderbook state.
    pub fn new(token_id: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            bids: Vec::new(),
            asks: Vec::new(),
            tick_size: DEFAULT_TICK_SIZE,
            last_trade_price: None,
            last_update: None,
            synced: false,
        }
    }

    /// Apply a full book snapshot, replacing all levels and marking the
    /// book synced.
    pub fn apply_book(&mut self, book: &BookMessage) {
        self.bids.clear();
        self.asks.clear();

        for level in &book.bids {
            if let (Ok(price), Ok(size)) = (level.price.parse(), level.size.parse())
                && size > Decimal::ZERO
            {
                self.bids.push(PriceLevel::new(price, size));
            }
        }
        for level in &book.asks {
            if let (Ok(price), Ok(size)) = (level.price.parse(), level.size.parse())
                && size > Decimal::ZERO
            {
                self.asks.push(PriceLevel::new(price, size));
            }
        }

        self.bids.sort_by(|a, b| b.price.cmp(&a.price));
        self.asks.sort_by(|a, b| a.price.cmp(&b.price));

        if let Some(ref tick) = book.min_tick_size
            && let Ok(tick) = tick.parse()
        {
            self.tick_size = tick;
        }

        self.last_update = parse_timestamp(&book.timestamp).or_else(|| Some(Utc::now()));
        self.synced = true;
    }

    /// Apply a single level change. A zero size removes the level.
    pub fn apply_price_change(&mut self, side: Side, price: Decimal, size: Decimal) {
        let levels = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };

        if let Some(i) = levels.iter().position(|l| l.price == price) {
            if size <= Decimal::ZERO {
                levels.remove(i);
            } else {
                levels[i] = PriceLevel::new(price, size);
            }
            return;
        }

        if size <= Decimal::ZERO {
            return;
        }

        let new_level = PriceLevel::new(price, size);
        let insert_at = match side {
            Side::Buy => levels.iter().position(|l| price > l.price),
            Side::Sell => levels.iter().position(|l| price < l.price),
        };
        match insert_at {
            Some(i) => levels.insert(i, new_level),
            None => levels.push(new_level),
        }
    }

    /// Apply an authoritative top-of-book update.
    pub fn apply_best_bid_ask(&mut self, msg: &BestBidAskMessage) {
        if let Some(ref bid) = msg.best_bid
            && let (Ok(price), Ok(size)) = (bid.price.parse::<Decimal>(), bid.size.parse())
        {
            match self.bids.first().copied() {
                Some(top) if top.price == price => self.bids[0] = PriceLevel::new(price, size),
                Some(top) if price > top.price => self.bids.insert(0, PriceLevel::new(price, size)),
                None => self.bids.push(PriceLevel::new(price, size)),
                _ => {}
            }
        }

        if let Some(ref ask) = msg.best_ask
            && let (Ok(price), Ok(size)) = (ask.price.parse::<Decimal>(), ask.size.parse())
        {
            match self.asks.first().copied() {
                Some(top) if top.price == price => self.asks[0] = PriceLevel::new(price, size),
                Some(top) if price < top.price => self.asks.insert(0, PriceLevel::new(price, size)),
                None => self.asks.push(PriceLevel::new(price, size)),
                _ => {}
            }
        }

        self.last_update = msg
            .timestamp
            .as_deref()
            .and_then(parse_timestamp_str)
            .or_else(|| Some(Utc::now()));
    }

    /// Record a trade print.
    pub fn set_last_trade(&mut self, price: Decimal, ts: DateTime<Utc>) {
        self.last_trade_price = Some(price);
        self.last_update = Some(ts);
    }

    /// Update the tick size. All later quotes must conform.
    pub fn set_tick_size(&mut self, tick_size: Decimal) {
        self.tick_size = tick_size;
        self.last_update = Some(Utc::now());
    }

    /// Mark the book as stale. Top-of-book is withheld until the next
    /// full snapshot.
    pub fn mark_stale(&mut self) {
        self.synced = false;
    }

    /// Whether a snapshot has been applied since the last disconnect.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Get the best bid level.
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    /// Get the best ask level.
    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    /// Top-of-book, only served from a synced, two-sided book.
    pub fn top_of_book(&self) -> Option<TopOfBook> {
        if !self.synced {
            return None;
        }
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        if bid.price >= ask.price {
            return None;
        }
        Some(TopOfBook {
            best_bid: bid.price,
            best_ask: ask.price,
            tick_size: self.tick_size,
            updated_at: self.last_update.unwrap_or_else(Utc::now),
        })
    }

    /// Spread between best ask and best bid.
    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    /// Spread in whole ticks.
    pub fn spread_ticks(&self) -> Option<i64> {
        if self.tick_size <= Decimal::ZERO {
            return None;
        }
        let spread = self.spread()?;
        (spread / self.tick_size).round().try_into().ok()
    }

    /// Mid price.
    pub fn mid_price(&self) -> Option<Decimal> {
        Some((self.best_bid()?.price + self.best_ask()?.price) / dec!(2))
    }

    /// Total bid depth over the first `levels` levels.
    pub fn bid_depth(&self, levels: usize) -> Decimal {
        self.bids.iter().take(levels).map(|l| l.size).sum()
    }

    /// Total ask depth over the first `levels` levels.
    pub fn ask_depth(&self, levels: usize) -> Decimal {
        self.asks.iter().take(levels).map(|l| l.size).sum()
    }

    /// Check if the book has both sides and is not crossed.
    pub fn is_valid(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid.price < ask.price,
            _ => false,
        }
    }

    /// Check if the book has been updated recently.
    pub fn is_fresh(&self, max_age: chrono::Duration, now: DateTime<Utc>) -> bool {
        match self.last_update {
            Some(ts) => now - ts <= max_age,
            None => false,
        }
    }
}

/// Parse a timestamp from a milliseconds string.
pub fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    parse_timestamp_str(ts)
}

fn parse_timestamp_str(ts: &str) -> Option<DateTime<Utc>> {
    ts.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderSummary, TopLevel};

    fn snapshot(bids: &[(&str, &str)], asks: &[(&str, &str)]) -> BookMessage {
        BookMessage {
            event_type: "book".to_string(),
            asset_id: "token1".to_string(),
            market: "cond1".to_string(),
            timestamp: "1704067200000".to_string(),
            hash: None,
            bids: bids
                .iter()
                .map(|(p, s)| OrderSummary {
                    price: p.to_string(),
                    size: s.to_string(),
                })
                .collect(),
            asks: asks
                .iter()
                .map(|(p, s)| OrderSummary {
                    price: p.to_string(),
                    size: s.to_string(),
                })
                .collect(),
            min_tick_size: Some("0.01".to_string()),
        }
    }

    #[test]
    fn test_apply_book_sorts_levels() {
        let mut state = OrderBookState::new("token1");
        state.apply_book(&snapshot(
            &[("0.44", "200"), ("0.45", "100")],
            &[("0.56", "250"), ("0.55", "150")],
        ));

        assert_eq!(state.best_bid().unwrap().price, dec!(0.45));
        assert_eq!(state.best_ask().unwrap().price, dec!(0.55));
        assert!(state.is_synced());
        assert_eq!(state.tick_size, dec!(0.01));
    }

    #[test]
    fn test_apply_price_change_update_and_remove() {
        let mut state = OrderBookState::new("token1");
        state.apply_book(&snapshot(&[("0.45", "100")], &[("0.55", "150")]));

        state.apply_price_change(Side::Buy, dec!(0.45), dec!(150));
        assert_eq!(state.best_bid().unwrap().size, dec!(150));

        state.apply_price_change(Side::Buy, dec!(0.45), Decimal::ZERO);
        assert!(state.best_bid().is_none());
    }

    #[test]
    fn test_apply_price_change_inserts_sorted() {
        let mut state = OrderBookState::new("token1");
        state.apply_book(&snapshot(&[("0.45", "100")], &[("0.55", "150")]));

        state.apply_price_change(Side::Buy, dec!(0.46), dec!(50));
        state.apply_price_change(Side::Buy, dec!(0.40), dec!(75));
        assert_eq!(state.bids[0].price, dec!(0.46));
        assert_eq!(state.bids[2].price, dec!(0.40));

        state.apply_price_change(Side::Sell, dec!(0.54), dec!(60));
        assert_eq!(state.asks[0].price, dec!(0.54));
    }

    #[test]
    fn test_top_of_book_requires_sync() {
        let mut state = OrderBookState::new("token1");
        state.apply_price_change(Side::Buy, dec!(0.45), dec!(100));
        state.apply_price_change(Side::Sell, dec!(0.55), dec!(100));

        // No snapshot applied yet
        assert!(state.top_of_book().is_none());

        state.apply_book(&snapshot(&[("0.45", "100")], &[("0.55", "100")]));
        let top = state.top_of_book().unwrap();
        assert_eq!(top.best_bid, dec!(0.45));
        assert_eq!(top.best_ask, dec!(0.55));
        assert_eq!(top.spread_ticks(), 10);

        state.mark_stale();
        assert!(state.top_of_book().is_none());
    }

    #[test]
    fn test_best_bid_ask_improves_top() {
        let mut state = OrderBookState::new("token1");
        state.apply_book(&snapshot(&[("0.45", "100")], &[("0.55", "100")]));

        let msg = BestBidAskMessage {
            event_type: "best_bid_ask".to_string(),
            asset_id: "token1".to_string(),
            timestamp: Some("1704067201000".to_string()),
            best_bid: Some(TopLevel {
                price: "0.46".to_string(),
                size: "80".to_string(),
            }),
            best_ask: Some(TopLevel {
                price: "0.54".to_string(),
                size: "90".to_string(),
            }),
        };
        state.apply_best_bid_ask(&msg);

        assert_eq!(state.best_bid().unwrap().price, dec!(0.46));
        assert_eq!(state.best_ask().unwrap().price, dec!(0.54));
    }

    #[test]
    fn test_spread_and_mid() {
        let mut state = OrderBookState::new("token1");
        state.apply_book(&snapshot(&[("0.48", "100")], &[("0.52", "100")]));

        assert_eq!(state.spread().unwrap(), dec!(0.04));
        assert_eq!(state.spread_ticks().unwrap(), 4);
        assert_eq!(state.mid_price().unwrap(), dec!(0.50));
    }

    #[test]
    fn test_depth_levels() {
        let mut state = OrderBookState::new("token1");
        state.apply_book(&snapshot(
            &[("0.45", "100"), ("0.44", "200"), ("0.43", "300")],
            &[("0.55", "150")],
        ));

        assert_eq!(state.bid_depth(2), dec!(300));
        assert_eq!(state.bid_depth(5), dec!(600));
        assert_eq!(state.ask_depth(5), dec!(150));
    }

    #[test]
    fn test_is_valid_rejects_crossed() {
        let mut state = OrderBookState::new("token1");
        state.apply_book(&snapshot(&[("0.56", "100")], &[("0.55", "100")]));
        assert!(!state.is_valid());
        assert!(state.top_of_book().is_none());
    }

    #[test]
    fn test_tick_size_change() {
        let mut state = OrderBookState::new("token1");
        state.apply_book(&snapshot(&[("0.45", "100")], &[("0.55", "100")]));
        state.set_tick_size(dec!(0.001));
        assert_eq!(state.top_of_book().unwrap().tick_size, dec!(0.001));
        assert_eq!(state.spread_ticks().unwrap(), 100);
    }

    #[test]
    fn test_freshness() {
        let mut state = OrderBookState::new("token1");
        let now = Utc::now();
        assert!(!state.is_fresh(chrono::Duration::seconds(10), now));

        state.apply_book(&snapshot(&[("0.45", "100")], &[("0.55", "100")]));
        state.last_update = Some(now - chrono::Duration::seconds(5));
        assert!(state.is_fresh(chrono::Duration::seconds(10), now));
        assert!(!state.is_fresh(chrono::Duration::seconds(3), now));
    }

    #[test]
    fn test_parse_timestamp() {
        let ts = parse_timestamp("1704067200000").unwrap();
        assert_eq!(ts.timestamp_millis(), 1704067200000);
        assert!(parse_timestamp("not-a-number").is_none());
    }
}
