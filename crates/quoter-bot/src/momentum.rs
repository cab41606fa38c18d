//! Momentum detection for adverse-selection protection.
//!
//! Two per-token triggers arm a quoting cooldown:
//!
//! - Price momentum: trade prints within the rolling window moved at
//!   least the threshold number of ticks.
//! - Depth sweep: a single update removed at least the configured
//!   fraction of visible depth on one side.
//!
//! While the cooldown is armed the quote engine yields `CancelAll` for
//! the token.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::warn;

use crate::config::MomentumConfig;

/// What armed the cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MomentumKind {
    PriceMove,
    DepthSweep,
}

impl std::fmt::Display for MomentumKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MomentumKind::PriceMove => write!(f, "price_move"),
            MomentumKind::DepthSweep => write!(f, "depth_sweep"),
        }
    }
}

/// Emitted when a cooldown is armed.
#[derive(Debug, Clone)]
pub struct MomentumEvent {
    pub token_id: String,
    pub kind: MomentumKind,
    pub detail: String,
    pub cooldown_until: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TokenMomentum {
    /// Recent trade prints, oldest first.
    trades: VecDeque<(DateTime<Utc>, Decimal)>,
    cooldown_until: Option<DateTime<Utc>>,
    last_bid_depth: Option<Decimal>,
    last_ask_depth: Option<Decimal>,
}

/// Per-token momentum state machine.
pub struct MomentumDetector {
    config: MomentumConfig,
    states: HashMap<String, TokenMomentum>,
}

impl MomentumDetector {
    pub fn new(config: MomentumConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
        }
    }

    fn state_mut(&mut self, token_id: &str) -> &mut TokenMomentum {
        self.states.entry(token_id.to_string()).or_default()
    }

    /// Whether the token is in cooldown at `now`.
    pub fn in_cooldown(&self, token_id: &str, now: DateTime<Utc>) -> bool {
        self.states
            .get(token_id)
            .and_then(|s| s.cooldown_until)
            .is_some_and(|until| now < until)
    }

    /// Remaining cooldown, if any.
    pub fn cooldown_remaining(&self, token_id: &str, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let until = self.states.get(token_id)?.cooldown_until?;
        (now < until).then(|| until - now)
    }

    /// Observe a trade print. Returns an event when the price window
    /// breaches the tick threshold.
    pub fn observe_trade(
        &mut self,
        token_id: &str,
        price: Decimal,
        tick_size: Decimal,
        ts: DateTime<Utc>,
    ) -> Option<MomentumEvent> {
        let window = chrono::Duration::milliseconds(self.config.window_ms as i64);
        let threshold = self.config.threshold_ticks;
        let state = self.state_mut(token_id);

        state.trades.push_back((ts, price));
        let cutoff = ts - window;
        while let Some(&(front_ts, _)) = state.trades.front() {
            if front_ts < cutoff {
                state.trades.pop_front();
            } else {
                break;
            }
        }

        if state.trades.len() < 2 || tick_size <= Decimal::ZERO {
            return None;
        }

        let first = state.trades.front().map(|&(_, p)| p)?;
        let last = state.trades.back().map(|&(_, p)| p)?;
        let move_ticks: i64 = ((last - first).abs() / tick_size)
            .round()
            .try_into()
            .unwrap_or(0);

        if move_ticks >= threshold as i64 {
            let detail = format!(
                "price moved {} ticks within {}ms",
                move_ticks, self.config.window_ms
            );
            return Some(self.arm_cooldown(token_id, MomentumKind::PriceMove, detail, ts));
        }
        None
    }

    /// Observe visible depth before/after a book update. Returns an event
    /// when one side lost at least the sweep fraction.
    pub fn observe_depth(
        &mut self,
        token_id: &str,
        bid_depth: Decimal,
        ask_depth: Decimal,
        ts: DateTime<Utc>,
    ) -> Option<MomentumEvent> {
        let threshold = self.config.sweep_depth_threshold;
        let state = self.state_mut(token_id);
        let last_bid = state.last_bid_depth;
        let last_ask = state.last_ask_depth;
        state.last_bid_depth = Some(bid_depth);
        state.last_ask_depth = Some(ask_depth);

        for (label, before, after) in [
            ("bid", last_bid, bid_depth),
            ("ask", last_ask, ask_depth),
        ] {
            let Some(before) = before else { continue };
            if before <= Decimal::ZERO {
                continue;
            }
            let removed = (before - after) / before;
            if removed >= threshold {
                let detail = format!(
                    "{} depth swept {}% ({} -> {})",
                    label,
                    (removed * Decimal::ONE_HUNDRED).round(),
                    before,
                    after
                );
                return Some(self.arm_cooldown(token_id, MomentumKind::DepthSweep, detail, ts));
            }
        }
        None
    }

    fn arm_cooldown(
        &mut self,
        token_id: &str,
        kind: MomentumKind,
        detail: String,
        now: DateTime<Utc>,
    ) -> MomentumEvent {
        let until = now + self.config.cooldown();
        self.state_mut(token_id).cooldown_until = Some(until);

        warn!(
            token_id = %token_id,
            kind = %kind,
            detail = %detail,
            cooldown_until = %until,
            "Momentum detected, quoting cooldown armed"
        );

        MomentumEvent {
            token_id: token_id.to_string(),
            kind,
            detail,
            cooldown_until: until,
        }
    }

    /// Clear cooldown for a token (manual intervention, tests).
    pub fn clear_cooldown(&mut self, token_id: &str) {
        if let Some(state) = self.states.get_mut(token_id) {
            state.cooldown_until = None;
        }
    }

    /// Tokens currently in cooldown.
    pub fn active_cooldowns(&self, now: DateTime<Utc>) -> Vec<&str> {
        self.states
            .iter()
            .filter(|(_, s)| s.cooldown_until.is_some_and(|until| now < until))
            .map(|(token, _)| token.as_str())
            .collect()
    }
}
