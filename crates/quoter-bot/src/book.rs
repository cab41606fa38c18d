//! Orderbook manager for the public market channel.
//!
//! Owns one `OrderBookState` per subscribed token and applies stream
//! events in arrival order. After a disconnect every book is stale and a
//! token is served again only once a fresh snapshot arrives.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use quoter_common::Side;
use quoter_exchange::orderbook::{OrderBookState, TopOfBook, parse_timestamp};

use crate::streams::MarketStreamEvent;

/// Result of applying one market event, with the inputs momentum
/// detection needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookApplied {
    /// Book levels changed.
    Updated {
        token_id: String,
        bid_depth_before: Decimal,
        ask_depth_before: Decimal,
        bid_depth_after: Decimal,
        ask_depth_after: Decimal,
    },
    /// A trade printed.
    Trade {
        token_id: String,
        price: Decimal,
        timestamp: DateTime<Utc>,
    },
    /// Tick size changed; later quotes must conform.
    TickSize { token_id: String, tick_size: Decimal },
}

/// Maintains public book state for the subscribed token set.
pub struct OrderbookManager {
    books: HashMap<String, OrderBookState>,
    /// Levels counted as visible depth for sweep detection.
    depth_levels: usize,
    stale_threshold: chrono::Duration,
}

impl OrderbookManager {
    pub fn new(assets: &[String], depth_levels: usize, stale_threshold_s: u64) -> Self {
        let books = assets
            .iter()
            .map(|a| (a.clone(), OrderBookState::new(a.clone())))
            .collect();
        Self {
            books,
            depth_levels,
            stale_threshold: chrono::Duration::seconds(stale_threshold_s as i64),
        }
    }

    /// Apply one market event. Unknown tokens are ignored.
    pub fn apply(&mut self, event: &MarketStreamEvent) -> Option<BookApplied> {
        match event {
            MarketStreamEvent::Book(msg) => {
                let book = self.books.get_mut(&msg.asset_id)?;
                let before = depth_pair(book, self.depth_levels);
                book.apply_book(msg);
                let after = depth_pair(book, self.depth_levels);
                debug!(
                    token_id = %msg.asset_id,
                    bids = msg.bids.len(),
                    asks = msg.asks.len(),
                    "Applied book snapshot"
                );
                Some(BookApplied::Updated {
                    token_id: msg.asset_id.clone(),
                    bid_depth_before: before.0,
                    ask_depth_before: before.1,
                    bid_depth_after: after.0,
                    ask_depth_after: after.1,
                })
            }
            MarketStreamEvent::PriceChange(msg) => {
                let book = self.books.get_mut(&msg.asset_id)?;
                let before = depth_pair(book, self.depth_levels);
                for change in &msg.price_changes {
                    let side: Side = match change.side.parse() {
                        Ok(s) => s,
                        Err(_) => continue,
                    };
                    let (Ok(price), Ok(size)) = (change.price.parse(), change.size.parse()) else {
                        continue;
                    };
                    book.apply_price_change(side, price, size);
                }
                book.last_update = parse_timestamp(&msg.timestamp).or_else(|| Some(Utc::now()));
                let after = depth_pair(book, self.depth_levels);
                Some(BookApplied::Updated {
                    token_id: msg.asset_id.clone(),
                    bid_depth_before: before.0,
                    ask_depth_before: before.1,
                    bid_depth_after: after.0,
                    ask_depth_after: after.1,
                })
            }
            MarketStreamEvent::BestBidAsk(msg) => {
                let book = self.books.get_mut(&msg.asset_id)?;
                let before = depth_pair(book, self.depth_levels);
                book.apply_best_bid_ask(msg);
                let after = depth_pair(book, self.depth_levels);
                Some(BookApplied::Updated {
                    token_id: msg.asset_id.clone(),
                    bid_depth_before: before.0,
                    ask_depth_before: before.1,
                    bid_depth_after: after.0,
                    ask_depth_after: after.1,
                })
            }
            MarketStreamEvent::LastTrade(msg) => {
                let book = self.books.get_mut(&msg.asset_id)?;
                let price: Decimal = msg.price.parse().ok()?;
                let ts = msg
                    .timestamp
                    .as_deref()
                    .and_then(parse_timestamp)
                    .unwrap_or_else(Utc::now);
                book.set_last_trade(price, ts);
                Some(BookApplied::Trade {
                    token_id: msg.asset_id.clone(),
                    price,
                    timestamp: ts,
                })
            }
            MarketStreamEvent::TickSizeChange(msg) => {
                let book = self.books.get_mut(&msg.asset_id)?;
                let tick: Decimal = msg.min_tick_size.parse().ok()?;
                let old = book.tick_size;
                book.set_tick_size(tick);
                warn!(
                    token_id = %msg.asset_id,
                    old_tick = %old,
                    new_tick = %tick,
                    "Tick size changed"
                );
                Some(BookApplied::TickSize {
                    token_id: msg.asset_id.clone(),
                    tick_size: tick,
                })
            }
            MarketStreamEvent::Connected => None,
            MarketStreamEvent::Disconnected(reason) => {
                self.mark_all_stale();
                warn!(reason = %reason, "Market stream disconnected, books marked stale");
                None
            }
        }
    }

    /// Top-of-book for a token. `None` until a snapshot has been applied
    /// since the last disconnect, or while the book is one-sided/crossed.
    pub fn get_top_of_book(&self, token_id: &str) -> Option<TopOfBook> {
        self.books.get(token_id)?.top_of_book()
    }

    /// Current mid price, if the book is valid.
    pub fn mid_price(&self, token_id: &str) -> Option<Decimal> {
        let book = self.books.get(token_id)?;
        if !book.is_synced() {
            return None;
        }
        book.mid_price()
    }

    /// The full book state for a token.
    pub fn book(&self, token_id: &str) -> Option<&OrderBookState> {
        self.books.get(token_id)
    }

    /// Current tick size for a token.
    pub fn tick_size(&self, token_id: &str) -> Option<Decimal> {
        self.books.get(token_id).map(|b| b.tick_size)
    }

    /// Whether a token's book is unusable for quoting: never synced,
    /// desynced by a disconnect, or silent past the stale threshold.
    pub fn is_stale(&self, token_id: &str, now: DateTime<Utc>) -> bool {
        match self.books.get(token_id) {
            Some(book) => !book.is_synced() || !book.is_fresh(self.stale_threshold, now),
            None => true,
        }
    }

    /// Mark every book stale. Called on disconnect; each token then waits
    /// for a fresh snapshot.
    pub fn mark_all_stale(&mut self) {
        for book in self.books.values_mut() {
            book.mark_stale();
        }
    }

    /// Tokens currently tracked.
    pub fn tokens(&self) -> impl Iterator<Item = &String> {
        self.books.keys()
    }
}

fn depth_pair(book: &OrderBookState, levels: usize) -> (Decimal, Decimal) {
    (book.bid_depth(levels), book.ask_depth(levels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quoter_exchange::types::{
        BookMessage, LastTradePriceMessage, OrderSummary, PriceChange, PriceChangeMessage,
        TickSizeChangeMessage,
    };
    use rust_decimal_macros::dec;

    fn manager() -> OrderbookManager {
        OrderbookManager::new(&["token1".to_string()], 5, 10)
    }

    fn book_event(bids: &[(&str, &str)], asks: &[(&str, &str)]) -> MarketStreamEvent {
        MarketStreamEvent::Book(BookMessage {
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
        })
    }

    #[test]
    fn test_snapshot_then_top_of_book() {
        let mut mgr = manager();
        assert!(mgr.get_top_of_book("token1").is_none());

        mgr.apply(&book_event(&[("0.45", "100")], &[("0.55", "150")]));

        let top = mgr.get_top_of_book("token1").unwrap();
        assert_eq!(top.best_bid, dec!(0.45));
        assert_eq!(top.best_ask, dec!(0.55));
    }

    #[test]
    fn test_unknown_token_ignored() {
        let mut mgr = manager();
        let event = MarketStreamEvent::LastTrade(LastTradePriceMessage {
            event_type: "last_trade_price".to_string(),
            asset_id: "mystery".to_string(),
            price: "0.50".to_string(),
            timestamp: None,
        });
        assert!(mgr.apply(&event).is_none());
    }

    #[test]
    fn test_disconnect_marks_stale_until_snapshot() {
        let mut mgr = manager();
        mgr.apply(&book_event(&[("0.45", "100")], &[("0.55", "150")]));
        assert!(mgr.get_top_of_book("token1").is_some());

        mgr.apply(&MarketStreamEvent::Disconnected("read error".to_string()));
        assert!(mgr.get_top_of_book("token1").is_none());
        assert!(mgr.is_stale("token1", Utc::now()));

        // Deltas alone do not resync the book
        let delta = MarketStreamEvent::PriceChange(PriceChangeMessage {
            event_type: "price_change".to_string(),
            asset_id: "token1".to_string(),
            market: "cond1".to_string(),
            timestamp: "1704067201000".to_string(),
            price_changes: vec![PriceChange {
                asset_id: Some("token1".to_string()),
                price: "0.46".to_string(),
                size: "50".to_string(),
                side: "buy".to_string(),
            }],
        });
        mgr.apply(&delta);
        assert!(mgr.get_top_of_book("token1").is_none());

        // A fresh snapshot restores service
        mgr.apply(&book_event(&[("0.46", "50")], &[("0.55", "150")]));
        assert!(mgr.get_top_of_book("token1").is_some());
    }

    #[test]
    fn test_trade_event_reported() {
        let mut mgr = manager();
        mgr.apply(&book_event(&[("0.45", "100")], &[("0.55", "150")]));

        let applied = mgr.apply(&MarketStreamEvent::LastTrade(LastTradePriceMessage {
            event_type: "last_trade_price".to_string(),
            asset_id: "token1".to_string(),
            price: "0.52".to_string(),
            timestamp: Some("1704067201000".to_string()),
        }));

        match applied {
            Some(BookApplied::Trade { price, .. }) => assert_eq!(price, dec!(0.52)),
            other => panic!("expected Trade, got {:?}", other),
        }
        assert_eq!(mgr.book("token1").unwrap().last_trade_price, Some(dec!(0.52)));
    }

    #[test]
    fn test_depth_before_after_on_delta() {
        let mut mgr = manager();
        mgr.apply(&book_event(
            &[("0.45", "100"), ("0.44", "100")],
            &[("0.55", "150")],
        ));

        // Remove most of the bid side in one update
        let delta = MarketStreamEvent::PriceChange(PriceChangeMessage {
            event_type: "price_change".to_string(),
            asset_id: "token1".to_string(),
            market: "cond1".to_string(),
            timestamp: "1704067201000".to_string(),
            price_changes: vec![
                PriceChange {
                    asset_id: Some("token1".to_string()),
                    price: "0.45".to_string(),
                    size: "0".to_string(),
                    side: "buy".to_string(),
                },
                PriceChange {
                    asset_id: Some("token1".to_string()),
                    price: "0.44".to_string(),
                    size: "10".to_string(),
                    side: "buy".to_string(),
                },
            ],
        });

        match mgr.apply(&delta) {
            Some(BookApplied::Updated {
                bid_depth_before,
                bid_depth_after,
                ..
            }) => {
                assert_eq!(bid_depth_before, dec!(200));
                assert_eq!(bid_depth_after, dec!(10));
            }
            other => panic!("expected Updated, got {:?}", other),
        }
    }

    #[test]
    fn test_tick_size_change_applies() {
        let mut mgr = manager();
        mgr.apply(&book_event(&[("0.45", "100")], &[("0.55", "150")]));

        mgr.apply(&MarketStreamEvent::TickSizeChange(TickSizeChangeMessage {
            event_type: "tick_size_change".to_string(),
            asset_id: "token1".to_string(),
            min_tick_size: "0.001".to_string(),
        }));

        assert_eq!(mgr.tick_size("token1").unwrap(), dec!(0.001));
        assert_eq!(mgr.get_top_of_book("token1").unwrap().tick_size, dec!(0.001));
    }

    #[test]
    fn test_staleness_by_age() {
        let mut mgr = manager();
        mgr.apply(&book_event(&[("0.45", "100")], &[("0.55", "150")]));

        let now = Utc::now();
        if let Some(book) = mgr.books.get_mut("token1") {
            book.last_update = Some(now - chrono::Duration::seconds(30));
        }
        assert!(mgr.is_stale("token1", now));
    }
}
