//! Two-sided quote computation with hysteresis.
//!
//! Pricing rule:
//! 1. Start at best bid / best ask.
//! 2. Improve one tick into the spread only when the spread is wide
//!    enough.
//! 3. Shift both sides down by the inventory skew (long inventory quotes
//!    lower, shedding risk; short inventory shifts up symmetrically).
//! 4. Clamp to the tradable range and never cross the opposing touch.
//!    Post-only would reject the cross anyway, but be explicit.
//! 5. Sizes come from inventory admission; a zero size suppresses that
//!    side.
//!
//! Replacements are only issued when a side deviates from the resting
//! quote by the refresh threshold, which preserves queue priority.

use rust_decimal::Decimal;

use quoter_exchange::orderbook::TopOfBook;

use crate::config::QuotingConfig;
use crate::types::{Quote, QuoteDecision, QuoteSide};

/// Inputs for one quote computation.
#[derive(Debug, Clone)]
pub struct QuoteContext {
    pub token_id: String,
    pub top: TopOfBook,
    /// Signed effective inventory.
    pub effective_size: Decimal,
    /// BUY size already passed through inventory admission.
    pub bid_size: Decimal,
    /// SELL size already bounded by the effective position.
    pub ask_size: Decimal,
    /// Momentum cooldown is armed.
    pub in_cooldown: bool,
    /// Book is stale or desynced.
    pub book_stale: bool,
}

/// Computes quote decisions. Pure: identical inputs yield identical
/// decisions.
pub struct QuoteEngine {
    config: QuotingConfig,
}

impl QuoteEngine {
    pub fn new(config: QuotingConfig) -> Self {
        Self { config }
    }

    /// Decide what to do with this token's quotes.
    pub fn decide(&self, ctx: &QuoteContext, resting: &Quote) -> QuoteDecision {
        if ctx.in_cooldown {
            return QuoteDecision::cancel_all("momentum cooldown");
        }
        if ctx.book_stale {
            return QuoteDecision::cancel_all("book stale");
        }

        let target = self.target_quote(ctx);

        if target.is_empty() {
            return if resting.is_empty() {
                QuoteDecision::Keep
            } else {
                QuoteDecision::cancel_all("no quotable side")
            };
        }

        if self.within_threshold(&target, resting, ctx.top.tick_size) {
            return QuoteDecision::Keep;
        }

        QuoteDecision::Replace(target)
    }

    /// The desired two-sided quote for the current book and inventory.
    pub fn target_quote(&self, ctx: &QuoteContext) -> Quote {
        let top = &ctx.top;
        let tick = top.tick_size;
        let one = Decimal::ONE;

        let mut bid = top.best_bid;
        let mut ask = top.best_ask;

        // Improve only when the spread leaves room.
        if top.spread_ticks() >= self.config.improve_when_spread_ticks as i64 {
            bid += tick;
            ask -= tick;
        }

        // Inventory skew in whole ticks, same shift on both sides.
        let skew_ticks = skew_ticks(self.config.skew_coefficient, ctx.effective_size);
        let shift = Decimal::from(skew_ticks) * tick;
        bid -= shift;
        ask -= shift;

        // Tradable range, then never cross the opposing touch.
        bid = bid.clamp(tick, one - tick).min(top.best_ask - tick);
        ask = ask.clamp(tick, one - tick).max(top.best_bid + tick);

        let bid_valid = bid >= tick && ctx.bid_size > Decimal::ZERO;
        let ask_valid = ask <= one - tick && ctx.ask_size > Decimal::ZERO;

        Quote {
            token_id: ctx.token_id.clone(),
            bid: bid_valid.then(|| QuoteSide::new(bid, ctx.bid_size)),
            ask: ask_valid.then(|| QuoteSide::new(ask, ctx.ask_size)),
        }
    }

    /// Hysteresis: both sides are within the refresh threshold of the
    /// resting quote.
    fn within_threshold(&self, target: &Quote, resting: &Quote, tick: Decimal) -> bool {
        let threshold = Decimal::from(self.config.refresh_threshold_ticks) * tick;

        let side_close = |t: &Option<QuoteSide>, r: &Option<QuoteSide>| match (t, r) {
            (Some(t), Some(r)) => (t.price - r.price).abs() < threshold,
            (None, None) => true,
            _ => false,
        };

        side_close(&target.bid, &resting.bid) && side_close(&target.ask, &resting.ask)
    }
}

/// skew = round(coefficient × inventory), in whole ticks.
fn skew_ticks(coefficient: Decimal, inventory: Decimal) -> i64 {
    (coefficient * inventory).round().try_into().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn top(best_bid: Decimal, best_ask: Decimal, tick: Decimal) -> TopOfBook {
        TopOfBook {
            best_bid,
            best_ask,
            tick_size: tick,
            updated_at: Utc::now(),
        }
    }

    fn ctx(best_bid: Decimal, best_ask: Decimal, effective: Decimal) -> QuoteContext {
        QuoteContext {
            token_id: "token1".to_string(),
            top: top(best_bid, best_ask, dec!(0.01)),
            effective_size: effective,
            bid_size: dec!(10),
            ask_size: dec!(10),
            in_cooldown: false,
            book_stale: false,
        }
    }

    fn engine() -> QuoteEngine {
        QuoteEngine::new(QuotingConfig::default())
    }

    #[test]
    fn test_quote_at_touch_when_spread_narrow() {
        // Spread of 1 tick with threshold 4: join the touch
        let quote = engine().target_quote(&ctx(dec!(0.50), dec!(0.51), Decimal::ZERO));
        assert_eq!(quote.bid.unwrap(), QuoteSide::new(dec!(0.50), dec!(10)));
        assert_eq!(quote.ask.unwrap(), QuoteSide::new(dec!(0.51), dec!(10)));
    }

    #[test]
    fn test_improve_when_spread_wide() {
        // Spread of 6 ticks: improve one tick on each side
        let quote = engine().target_quote(&ctx(dec!(0.40), dec!(0.46), Decimal::ZERO));
        assert_eq!(quote.bid.unwrap().price, dec!(0.41));
        assert_eq!(quote.ask.unwrap().price, dec!(0.45));
    }

    #[test]
    fn test_inventory_skew_shifts_both_sides_down() {
        // effective +20 with coefficient 0.1: two ticks down
        let quote = engine().target_quote(&ctx(dec!(0.40), dec!(0.46), dec!(20)));
        assert_eq!(quote.bid.unwrap().price, dec!(0.39));
        assert_eq!(quote.ask.unwrap().price, dec!(0.43));
    }

    #[test]
    fn test_short_inventory_shifts_up() {
        let quote = engine().target_quote(&ctx(dec!(0.40), dec!(0.46), dec!(-20)));
        assert_eq!(quote.bid.unwrap().price, dec!(0.43));
        // Ask shifted up but clamped below nothing; 0.45 + 0.02 = 0.47
        assert_eq!(quote.ask.unwrap().price, dec!(0.47));
    }

    #[test]
    fn test_skew_cross_clamped() {
        // Huge long inventory pushes the ask through the bid; it is
        // clamped one tick above the best bid.
        let quote = engine().target_quote(&ctx(dec!(0.50), dec!(0.52), dec!(100)));
        let ask = quote.ask.unwrap().price;
        assert_eq!(ask, dec!(0.51));
        let bid = quote.bid.unwrap().price;
        assert!(bid < ask);
        assert!(bid >= dec!(0.01));
    }

    #[test]
    fn test_bid_side_suppressed_near_floor() {
        // best_ask at one tick: no room for a post-only bid below it
        let quote = engine().target_quote(&ctx(dec!(0.005), dec!(0.01), Decimal::ZERO));
        assert!(quote.bid.is_none());
    }

    #[test]
    fn test_ask_side_suppressed_near_ceiling() {
        let quote = engine().target_quote(&ctx(dec!(0.99), dec!(0.999), Decimal::ZERO));
        assert!(quote.ask.is_none());
    }

    #[test]
    fn test_zero_sizes_suppress_sides() {
        let mut c = ctx(dec!(0.40), dec!(0.46), Decimal::ZERO);
        c.bid_size = Decimal::ZERO;
        let quote = engine().target_quote(&c);
        assert!(quote.bid.is_none());
        assert!(quote.ask.is_some());

        c.bid_size = dec!(10);
        c.ask_size = Decimal::ZERO;
        let quote = engine().target_quote(&c);
        assert!(quote.bid.is_some());
        assert!(quote.ask.is_none());
    }

    #[test]
    fn test_cooldown_cancels() {
        let mut c = ctx(dec!(0.40), dec!(0.46), Decimal::ZERO);
        c.in_cooldown = true;
        let decision = engine().decide(&c, &Quote::empty("token1"));
        assert!(matches!(decision, QuoteDecision::CancelAll { .. }));
    }

    #[test]
    fn test_stale_book_cancels() {
        let mut c = ctx(dec!(0.40), dec!(0.46), Decimal::ZERO);
        c.book_stale = true;
        let decision = engine().decide(&c, &Quote::empty("token1"));
        match decision {
            QuoteDecision::CancelAll { reason } => assert!(reason.contains("stale")),
            other => panic!("expected CancelAll, got {:?}", other),
        }
    }

    #[test]
    fn test_replace_when_no_resting_quote() {
        let decision = engine().decide(
            &ctx(dec!(0.40), dec!(0.46), Decimal::ZERO),
            &Quote::empty("token1"),
        );
        match decision {
            QuoteDecision::Replace(quote) => {
                assert_eq!(quote.bid.unwrap().price, dec!(0.41));
                assert_eq!(quote.ask.unwrap().price, dec!(0.45));
            }
            other => panic!("expected Replace, got {:?}", other),
        }
    }

    #[test]
    fn test_keep_within_hysteresis() {
        // Resting one tick away from target, threshold two ticks: keep
        let resting = Quote {
            token_id: "token1".to_string(),
            bid: Some(QuoteSide::new(dec!(0.40), dec!(10))),
            ask: Some(QuoteSide::new(dec!(0.46), dec!(10))),
        };
        let decision = engine().decide(&ctx(dec!(0.40), dec!(0.46), Decimal::ZERO), &resting);
        assert_eq!(decision, QuoteDecision::Keep);
    }

    #[test]
    fn test_replace_past_hysteresis() {
        let resting = Quote {
            token_id: "token1".to_string(),
            bid: Some(QuoteSide::new(dec!(0.37), dec!(10))),
            ask: Some(QuoteSide::new(dec!(0.45), dec!(10))),
        };
        // Target bid 0.41 is four ticks from resting 0.37
        let decision = engine().decide(&ctx(dec!(0.40), dec!(0.46), Decimal::ZERO), &resting);
        assert!(matches!(decision, QuoteDecision::Replace(_)));
    }

    #[test]
    fn test_missing_resting_side_forces_replace() {
        let resting = Quote {
            token_id: "token1".to_string(),
            bid: Some(QuoteSide::new(dec!(0.41), dec!(10))),
            ask: None,
        };
        let decision = engine().decide(&ctx(dec!(0.40), dec!(0.46), Decimal::ZERO), &resting);
        assert!(matches!(decision, QuoteDecision::Replace(_)));
    }

    #[test]
    fn test_no_quotable_side_cancels_resting() {
        let mut c = ctx(dec!(0.40), dec!(0.46), Decimal::ZERO);
        c.bid_size = Decimal::ZERO;
        c.ask_size = Decimal::ZERO;

        let resting = Quote {
            token_id: "token1".to_string(),
            bid: Some(QuoteSide::new(dec!(0.40), dec!(10))),
            ask: None,
        };
        let decision = engine().decide(&c, &resting);
        assert!(matches!(decision, QuoteDecision::CancelAll { .. }));

        // With nothing resting there is nothing to do
        let decision = engine().decide(&c, &Quote::empty("token1"));
        assert_eq!(decision, QuoteDecision::Keep);
    }

    #[test]
    fn test_decision_deterministic() {
        let c = ctx(dec!(0.40), dec!(0.46), dec!(20));
        let resting = Quote::empty("token1");
        let a = engine().decide(&c, &resting);
        let b = engine().decide(&c, &resting);
        assert_eq!(a, b);
    }

    #[test]
    fn test_skew_ticks_rounding() {
        assert_eq!(skew_ticks(dec!(0.1), dec!(20)), 2);
        assert_eq!(skew_ticks(dec!(0.1), dec!(24)), 2);
        assert_eq!(skew_ticks(dec!(0.1), dec!(25)), 3);
        assert_eq!(skew_ticks(dec!(0.1), dec!(-20)), -2);
        assert_eq!(skew_ticks(Decimal::ZERO, dec!(100)), 0);
    }
}
