//! Realized P&L tracking with per-trade visibility.
//!
//! P&L is realized on sells only, against the average entry price held
//! before the fill. Buys accumulate volume and fees. A running session
//! summary is logged periodically so rapid quoting cycles stay
//! interpretable.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::info;

use quoter_common::Side;

use crate::types::Fill;

/// Wins and losses below this are treated as breakeven noise.
const BREAKEVEN_EPSILON: Decimal = dec!(0.001);

/// Result of a single sell trade closing part of a position.
#[derive(Debug, Clone)]
pub struct TradeOutcome {
    pub timestamp: DateTime<Utc>,
    pub token_id: String,
    pub shares_sold: Decimal,
    pub sell_price: Decimal,
    pub avg_buy_price: Decimal,
    /// Price difference only.
    pub gross_pnl: Decimal,
    pub fee: Decimal,
    /// Gross minus fee.
    pub net_pnl: Decimal,
    pub position_remaining: Decimal,
}

/// Accumulated statistics for a market or the session.
#[derive(Debug, Clone, Default)]
pub struct PnlStats {
    pub total_buys: u32,
    pub total_sells: u32,
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    pub buy_notional: Decimal,
    pub sell_notional: Decimal,
    pub gross_pnl: Decimal,
    pub total_fees: Decimal,
    pub net_pnl: Decimal,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub breakeven_trades: u32,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
}

impl PnlStats {
    pub fn trade_count(&self) -> u32 {
        self.total_buys + self.total_sells
    }

    /// Win rate over closed trades, 0..=1.
    pub fn win_rate(&self) -> Decimal {
        let closed = self.winning_trades + self.losing_trades + self.breakeven_trades;
        if closed == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.winning_trades) / Decimal::from(closed)
    }

    fn record_buy(&mut self, fill: &Fill) {
        self.total_buys += 1;
        self.buy_volume += fill.size;
        self.buy_notional += fill.notional();
        self.total_fees += fill.fee;
        self.net_pnl -= fill.fee;
    }

    fn record_sell(&mut self, fill: &Fill, outcome: &TradeOutcome) {
        self.total_sells += 1;
        self.sell_volume += fill.size;
        self.sell_notional += fill.notional();
        self.total_fees += fill.fee;
        self.gross_pnl += outcome.gross_pnl;
        self.net_pnl += outcome.net_pnl;

        if outcome.net_pnl > BREAKEVEN_EPSILON {
            self.winning_trades += 1;
            self.largest_win = self.largest_win.max(outcome.net_pnl);
        } else if outcome.net_pnl < -BREAKEVEN_EPSILON {
            self.losing_trades += 1;
            self.largest_loss = self.largest_loss.min(outcome.net_pnl);
        } else {
            self.breakeven_trades += 1;
        }
    }
}

/// Session-level realized P&L tracker.
pub struct PnlTracker {
    session: PnlStats,
    session_start: DateTime<Utc>,
    market_stats: HashMap<String, PnlStats>,
    market_labels: HashMap<String, String>,
    log_interval: chrono::Duration,
    last_summary_at: DateTime<Utc>,
}

impl PnlTracker {
    pub fn new(log_interval_s: u64) -> Self {
        let now = Utc::now();
        Self {
            session: PnlStats::default(),
            session_start: now,
            market_stats: HashMap::new(),
            market_labels: HashMap::new(),
            log_interval: chrono::Duration::seconds(log_interval_s as i64),
            last_summary_at: now,
        }
    }

    /// Attach a human-readable name for log lines.
    pub fn set_market_label(&mut self, token_id: &str, label: &str) {
        self.market_labels
            .insert(token_id.to_string(), label.to_string());
    }

    fn label(&self, token_id: &str) -> String {
        self.market_labels
            .get(token_id)
            .cloned()
            .unwrap_or_else(|| {
                let mut short = token_id.to_string();
                short.truncate(16);
                short
            })
    }

    pub fn session_stats(&self) -> &PnlStats {
        &self.session
    }

    pub fn market_stats(&self, token_id: &str) -> Option<&PnlStats> {
        self.market_stats.get(token_id)
    }

    /// Realized P&L for a market.
    pub fn market_realized(&self, token_id: &str) -> Decimal {
        self.market_stats
            .get(token_id)
            .map(|s| s.net_pnl)
            .unwrap_or(Decimal::ZERO)
    }

    /// Record a fill. Sells realize P&L against the average entry held
    /// before the fill; returns the outcome for sells.
    pub fn record_fill(
        &mut self,
        fill: &Fill,
        avg_entry_before: Decimal,
        position_before: Decimal,
    ) -> Option<TradeOutcome> {
        let market = self
            .market_stats
            .entry(fill.token_id.clone())
            .or_default();

        match fill.side {
            Side::Buy => {
                market.record_buy(fill);
                self.session.record_buy(fill);
                info!(
                    market = %self.label(&fill.token_id),
                    size = %fill.size,
                    price = %fill.price,
                    "BUY fill"
                );
                None
            }
            Side::Sell => {
                // Cannot have sold more than was held.
                let shares_sold = fill.size.min(position_before.max(Decimal::ZERO));
                if shares_sold <= Decimal::ZERO {
                    info!(
                        market = %self.label(&fill.token_id),
                        size = %fill.size,
                        "SELL fill with no tracked position, skipping P&L"
                    );
                    return None;
                }

                let gross_pnl = (fill.price - avg_entry_before) * shares_sold;
                let outcome = TradeOutcome {
                    timestamp: fill.timestamp,
                    token_id: fill.token_id.clone(),
                    shares_sold,
                    sell_price: fill.price,
                    avg_buy_price: avg_entry_before,
                    gross_pnl,
                    fee: fill.fee,
                    net_pnl: gross_pnl - fill.fee,
                    position_remaining: (position_before - fill.size).max(Decimal::ZERO),
                };

                market.record_sell(fill, &outcome);
                self.session.record_sell(fill, &outcome);

                info!(
                    market = %self.label(&fill.token_id),
                    size = %shares_sold,
                    price = %fill.price,
                    entry = %avg_entry_before,
                    pnl = %outcome.net_pnl,
                    session_pnl = %self.session.net_pnl,
                    "SELL fill"
                );

                Some(outcome)
            }
        }
    }

    /// Unrealized P&L for a position marked at the given mid.
    pub fn unrealized(effective_size: Decimal, avg_entry: Decimal, mid: Decimal) -> Decimal {
        effective_size * (mid - avg_entry)
    }

    /// Log a session summary if the interval elapsed. Returns whether a
    /// summary was logged.
    pub fn maybe_log_summary(&mut self, now: DateTime<Utc>, force: bool) -> bool {
        if !force && now - self.last_summary_at < self.log_interval {
            return false;
        }
        self.last_summary_at = now;

        let s = &self.session;
        let elapsed = now - self.session_start;
        info!(
            duration_min = elapsed.num_minutes(),
            net_pnl = %s.net_pnl,
            gross_pnl = %s.gross_pnl,
            fees = %s.total_fees,
            trades = s.trade_count(),
            buys = s.total_buys,
            sells = s.total_sells,
            win_rate = %s.win_rate(),
            "Session P&L summary"
        );
        true
    }
}
