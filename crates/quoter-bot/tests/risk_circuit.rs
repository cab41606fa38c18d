//! Circuit-breaker scenarios: momentum cooldowns, the user-channel
//! disconnect halt, and recovery.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use quoter_bot::config::{MomentumConfig, QuoterConfig, RiskConfig};
use quoter_bot::momentum::{MomentumDetector, MomentumKind};
use quoter_bot::order_manager::OrderManager;
use quoter_bot::quote_engine::{QuoteContext, QuoteEngine};
use quoter_bot::risk::{RiskEvent, RiskManager, RiskScope, RiskState};
use quoter_bot::types::{Quote, QuoteDecision, QuoteSide};
use quoter_exchange::orderbook::TopOfBook;
use quoter_exchange::rest::ExchangeClient;

fn quoting_context(in_cooldown: bool) -> QuoteContext {
    QuoteContext {
        token_id: "token1".to_string(),
        top: TopOfBook {
            best_bid: dec!(0.50),
            best_ask: dec!(0.54),
            tick_size: dec!(0.01),
            updated_at: Utc::now(),
        },
        effective_size: Decimal::ZERO,
        bid_size: dec!(10),
        ask_size: dec!(10),
        in_cooldown,
        book_stale: false,
    }
}

#[test]
fn momentum_burst_cancels_quotes_for_the_cooldown() {
    // Trade prints moving 0.50 -> 0.54 within 500ms is a four-tick move
    // over the three-tick threshold: the cooldown arms for 2s and the
    // quote engine yields CancelAll until it expires.
    let mut detector = MomentumDetector::new(MomentumConfig::default());
    let t0 = Utc::now();

    assert!(detector
        .observe_trade("token1", dec!(0.50), dec!(0.01), t0)
        .is_none());
    let event = detector
        .observe_trade(
            "token1",
            dec!(0.54),
            dec!(0.01),
            t0 + Duration::milliseconds(200),
        )
        .expect("momentum should arm");
    assert_eq!(event.kind, MomentumKind::PriceMove);

    let engine = QuoteEngine::new(QuoterConfig::default().quoting);
    let during = t0 + Duration::milliseconds(500);
    assert!(detector.in_cooldown("token1", during));

    let decision = engine.decide(
        &quoting_context(detector.in_cooldown("token1", during)),
        &Quote {
            token_id: "token1".to_string(),
            bid: Some(QuoteSide::new(dec!(0.50), dec!(10))),
            ask: Some(QuoteSide::new(dec!(0.54), dec!(10))),
        },
    );
    assert!(matches!(decision, QuoteDecision::CancelAll { .. }));

    // After the cooldown quoting resumes.
    let after = t0 + Duration::seconds(3);
    assert!(!detector.in_cooldown("token1", after));
    let decision = engine.decide(
        &quoting_context(detector.in_cooldown("token1", after)),
        &Quote::empty("token1"),
    );
    assert!(matches!(decision, QuoteDecision::Replace(_)));
}

#[test]
fn user_channel_disconnect_halts_globally_and_blocks_placements() {
    // While quoting several assets, the authenticated stream drops: the
    // breaker collapses to HALTED, a global kill switch fires, and no
    // further placements reach the order manager.
    let mut risk = RiskManager::new(RiskConfig::default());
    risk.on_market_connected();
    risk.on_user_reconciled();

    let now = Utc::now();
    let events = risk.on_user_disconnect(now);

    assert_eq!(risk.state(), RiskState::Halted);
    assert_eq!(risk.multiplier(), Decimal::ZERO);
    assert!(events.iter().any(|e| matches!(
        e,
        RiskEvent::KillSwitch {
            scope: RiskScope::Global
        }
    )));
    for token in ["a", "b", "c"] {
        assert!(!risk.can_place(token, now).0);
    }

    // The order manager mirrors the halt and drops place requests.
    let mut config = QuoterConfig::default();
    config.assets = vec!["a".to_string()];
    config.dry_run = true;
    let client = Arc::new(ExchangeClient::with_url("http://127.0.0.1:1"));
    let mut orders = OrderManager::new(client, &config);
    orders.set_halted(risk.state() == RiskState::Halted);

    let staged = orders.stage_quote(
        &Quote {
            token_id: "a".to_string(),
            bid: Some(QuoteSide::new(dec!(0.50), dec!(10))),
            ask: Some(QuoteSide::new(dec!(0.54), dec!(10))),
        },
        0,
    );
    assert_eq!(staged, 0);
}

#[test]
fn halt_recovers_through_reduced_limits() {
    let mut risk = RiskManager::new(RiskConfig::default());
    risk.on_market_connected();
    risk.on_user_reconciled();
    let t0 = Utc::now();

    risk.on_user_disconnect(t0);
    assert_eq!(risk.state(), RiskState::Halted);

    // Reconnect and reconcile, then wait out the cooldown.
    risk.on_user_reconciled();
    risk.tick(t0 + Duration::seconds(301));
    assert_eq!(risk.state(), RiskState::Recovering);
    assert_eq!(risk.multiplier(), dec!(0.25));

    // A quiet recovery interval restores full limits.
    risk.tick(t0 + Duration::seconds(301 + 61));
    assert_eq!(risk.state(), RiskState::Normal);
    assert_eq!(risk.multiplier(), Decimal::ONE);
}

#[test]
fn drawdown_halts_only_the_affected_market() {
    let mut risk = RiskManager::new(RiskConfig::default());
    risk.on_market_connected();
    risk.on_user_reconciled();
    let now = Utc::now();

    risk.update_market_pnl("a", dec!(25), Decimal::ZERO, now);
    let events = risk.update_market_pnl("a", Decimal::ZERO, Decimal::ZERO, now);

    assert!(events.iter().any(|e| matches!(
        e,
        RiskEvent::KillSwitch {
            scope: RiskScope::Market(token)
        } if token == "a"
    )));
    assert!(!risk.can_place("a", now).0);
    assert!(risk.can_place("b", now).0);
    assert_eq!(risk.state(), RiskState::Normal);
}
