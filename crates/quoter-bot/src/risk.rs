//! Per-market and global risk tracking with a circuit breaker.
//!
//! States: NORMAL -> WARNING -> HALTED -> RECOVERING -> NORMAL.
//! Position-limit multipliers per state: 1.0 / 0.5 / 0.25 / 0.0.
//!
//! WARNING: public feed disconnect, stale feeds, an unresolved WS gap
//! pending reconcile, or consecutive errors at the warn threshold.
//! HALTED: user-channel disconnect, drawdown breaches (per-market halts
//! that market, global halts everything), error thresholds, a single
//! trade loss past the cap, or a gap that outlives its reconcile budget.
//! Entering HALTED emits a kill switch for the affected scope.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{error, info, warn};

use crate::config::RiskConfig;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskState {
    Normal,
    Warning,
    Halted,
    Recovering,
}

impl RiskState {
    /// Position-limit multiplier applied by the inventory manager.
    pub fn multiplier(&self) -> Decimal {
        match self {
            RiskState::Normal => Decimal::ONE,
            RiskState::Warning => dec!(0.5),
            RiskState::Recovering => dec!(0.25),
            RiskState::Halted => Decimal::ZERO,
        }
    }
}

impl std::fmt::Display for RiskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskState::Normal => "NORMAL",
            RiskState::Warning => "WARNING",
            RiskState::Halted => "HALTED",
            RiskState::Recovering => "RECOVERING",
        };
        write!(f, "{}", s)
    }
}

/// Scope affected by a kill switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskScope {
    Market(String),
    Global,
}

/// Events for the orchestrator to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskEvent {
    StateChanged {
        old: RiskState,
        new: RiskState,
        reason: String,
    },
    MarketHalted {
        token_id: String,
        reason: String,
    },
    /// Cancel all outstanding orders in the scope.
    KillSwitch { scope: RiskScope },
}

/// Risk state for a single market.
#[derive(Debug, Clone)]
pub struct MarketRisk {
    pub token_id: String,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub peak_pnl: Decimal,
    pub drawdown: Decimal,
    pub last_feed_at: Option<DateTime<Utc>>,
    pub stale: bool,
    pub halted: bool,
    pub halt_reason: String,
    pub end_time: Option<DateTime<Utc>>,
}

impl MarketRisk {
    fn new(token_id: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            peak_pnl: Decimal::ZERO,
            drawdown: Decimal::ZERO,
            last_feed_at: None,
            stale: false,
            halted: false,
            halt_reason: String::new(),
            end_time: None,
        }
    }

    pub fn total_pnl(&self) -> Decimal {
        self.realized_pnl + self.unrealized_pnl
    }

    fn update_pnl(&mut self, realized: Decimal, unrealized: Decimal) {
        self.realized_pnl = realized;
        self.unrealized_pnl = unrealized;
        let total = self.total_pnl();
        if total > self.peak_pnl {
            self.peak_pnl = total;
        }
        self.drawdown = (self.peak_pnl - total).max(Decimal::ZERO);
    }
}

/// Per-market and global circuit breaker.
pub struct RiskManager {
    config: RiskConfig,
    markets: HashMap<String, MarketRisk>,
    state: RiskState,

    peak_total_pnl: Decimal,
    global_drawdown: Decimal,

    halted_at: Option<DateTime<Utc>>,
    recovering_since: Option<DateTime<Utc>>,
    last_fault_at: Option<DateTime<Utc>>,

    consecutive_errors: u32,
    last_error_at: Option<DateTime<Utc>>,
    /// Error timestamps within the last hour.
    error_window: VecDeque<DateTime<Utc>>,

    gap_unresolved: bool,
    gap_attempts: u32,

    market_connected: bool,
    /// True while the user channel is connected and reconciled.
    user_channel_ok: bool,
    /// Fatal faults never auto-recover; an operator must reset.
    fatal: bool,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            markets: HashMap::new(),
            state: RiskState::Normal,
            peak_total_pnl: Decimal::ZERO,
            global_drawdown: Decimal::ZERO,
            halted_at: None,
            recovering_since: None,
            last_fault_at: None,
            consecutive_errors: 0,
            last_error_at: None,
            error_window: VecDeque::new(),
            gap_unresolved: false,
            gap_attempts: 0,
            market_connected: false,
            user_channel_ok: false,
            fatal: false,
        }
    }

    pub fn state(&self) -> RiskState {
        self.state
    }

    pub fn multiplier(&self) -> Decimal {
        self.state.multiplier()
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn global_drawdown(&self) -> Decimal {
        self.global_drawdown
    }

    fn market_mut(&mut self, token_id: &str) -> &mut MarketRisk {
        self.markets
            .entry(token_id.to_string())
            .or_insert_with(|| MarketRisk::new(token_id))
    }

    pub fn market(&self, token_id: &str) -> Option<&MarketRisk> {
        self.markets.get(token_id)
    }

    pub fn set_market_end_time(&mut self, token_id: &str, end_time: Option<DateTime<Utc>>) {
        self.market_mut(token_id).end_time = end_time;
    }

    /// Consecutive errors at which WARNING is entered.
    fn error_warn_threshold(&self) -> u32 {
        self.config.max_consecutive_errors.div_ceil(2).max(1)
    }

    // --- State machine ---

    fn transition(
        &mut self,
        new: RiskState,
        reason: &str,
        now: DateTime<Utc>,
        events: &mut Vec<RiskEvent>,
    ) {
        let old = self.state;
        if old == new {
            return;
        }
        self.state = new;

        match new {
            RiskState::Halted => {
                self.halted_at = Some(now);
                self.recovering_since = None;
            }
            RiskState::Recovering => {
                self.recovering_since = Some(now);
                self.last_fault_at = None;
                // Drawdown restarts from the current level; without this
                // the old peak would re-halt immediately.
                self.reset_peaks();
            }
            RiskState::Normal => {
                self.halted_at = None;
                self.recovering_since = None;
            }
            RiskState::Warning => {}
        }

        warn!(old = %old, new = %new, reason = %reason, "Circuit breaker transition");
        events.push(RiskEvent::StateChanged {
            old,
            new,
            reason: reason.to_string(),
        });

        if new == RiskState::Halted {
            events.push(RiskEvent::KillSwitch {
                scope: RiskScope::Global,
            });
        }
    }

    fn trigger_warning(&mut self, reason: &str, now: DateTime<Utc>, events: &mut Vec<RiskEvent>) {
        self.last_fault_at = Some(now);
        if self.state == RiskState::Normal {
            self.transition(RiskState::Warning, reason, now, events);
        }
    }

    fn trigger_halt(&mut self, reason: &str, now: DateTime<Utc>, events: &mut Vec<RiskEvent>) {
        self.last_fault_at = Some(now);
        if self.state != RiskState::Halted {
            self.transition(RiskState::Halted, reason, now, events);
        }
    }

    fn reset_peaks(&mut self) {
        let total: Decimal = self.markets.values().map(|m| m.total_pnl()).sum();
        self.peak_total_pnl = total;
        self.global_drawdown = Decimal::ZERO;
        for market in self.markets.values_mut() {
            market.peak_pnl = market.total_pnl();
            market.drawdown = Decimal::ZERO;
        }
    }

    /// Advance time-based transitions. Call every tick.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<RiskEvent> {
        let mut events = Vec::new();

        match self.state {
            RiskState::Halted => {
                if self.config.require_manual_reset || !self.config.auto_recover {
                    return events;
                }
                let cooldown_over = self.halted_at.is_some_and(|at| {
                    (now - at).num_seconds() >= self.config.circuit_breaker_cooldown_s as i64
                });
                if cooldown_over && self.halt_causes_cleared() {
                    self.transition(RiskState::Recovering, "cooldown elapsed, causes cleared", now, &mut events);
                }
            }
            RiskState::Recovering => {
                // The quiet interval restarts on every new fault.
                if let Some(since) = self.recovering_since {
                    let anchor = match self.last_fault_at {
                        Some(fault) if fault > since => fault,
                        _ => since,
                    };
                    if (now - anchor).num_seconds()
                        >= self.config.circuit_breaker_recovery_s as i64
                    {
                        self.transition(
                            RiskState::Normal,
                            "recovery interval complete",
                            now,
                            &mut events,
                        );
                    }
                }
            }
            RiskState::Warning => {
                if self.warning_causes_cleared() {
                    self.transition(RiskState::Normal, "warning causes cleared", now, &mut events);
                }
            }
            RiskState::Normal => {}
        }

        events
    }

    fn halt_causes_cleared(&self) -> bool {
        !self.fatal
            && self.user_channel_ok
            && self.market_connected
            && !self.gap_unresolved
            && !self.markets.values().any(|m| m.stale)
    }

    fn warning_causes_cleared(&self) -> bool {
        self.market_connected
            && !self.gap_unresolved
            && !self.markets.values().any(|m| m.stale)
            && self.consecutive_errors < self.error_warn_threshold()
    }

    // --- Feed freshness ---

    pub fn record_feed_update(&mut self, token_id: &str, now: DateTime<Utc>) {
        let market = self.market_mut(token_id);
        market.last_feed_at = Some(now);
        market.stale = false;
    }

    /// Mark markets stale when they have gone quiet. Resolved markets are
    /// not monitored.
    pub fn check_freshness(&mut self, now: DateTime<Utc>) -> Vec<RiskEvent> {
        let threshold = chrono::Duration::seconds(self.config.stale_feed_threshold_s as i64);
        let mut newly_stale = 0usize;

        for market in self.markets.values_mut() {
            if market.end_time.is_some_and(|end| now >= end) {
                market.stale = false;
                continue;
            }
            let Some(last) = market.last_feed_at else {
                continue;
            };
            if now - last > threshold {
                if !market.stale {
                    market.stale = true;
                    newly_stale += 1;
                    warn!(
                        token_id = %market.token_id,
                        silent_for_s = (now - last).num_seconds(),
                        "Market feed stale"
                    );
                }
            }
        }

        let mut events = Vec::new();
        if newly_stale > 0 {
            self.trigger_warning(&format!("{} stale feeds", newly_stale), now, &mut events);
        }
        events
    }

    // --- Connection events ---

    pub fn on_market_disconnect(&mut self, now: DateTime<Utc>) -> Vec<RiskEvent> {
        self.market_connected = false;
        let mut events = Vec::new();
        self.trigger_warning("market feed disconnected", now, &mut events);
        events
    }

    pub fn on_market_connected(&mut self) {
        self.market_connected = true;
    }

    /// User-channel disconnect is a hard fault: fills cannot be tracked.
    pub fn on_user_disconnect(&mut self, now: DateTime<Utc>) -> Vec<RiskEvent> {
        self.user_channel_ok = false;
        let mut events = Vec::new();
        error!("User channel disconnected, halting");
        self.trigger_halt("user channel disconnected", now, &mut events);
        events
    }

    /// User channel is connected and the open-order map reconciled.
    pub fn on_user_reconciled(&mut self) {
        self.user_channel_ok = true;
    }

    // --- WebSocket gaps ---

    pub fn record_gap(&mut self, now: DateTime<Utc>) -> Vec<RiskEvent> {
        self.gap_unresolved = true;
        self.gap_attempts += 1;
        let mut events = Vec::new();

        if self.config.halt_on_ws_gaps && self.gap_attempts >= self.config.ws_gap_reconcile_attempts
        {
            self.trigger_halt(
                &format!("ws gap unresolved after {} attempts", self.gap_attempts),
                now,
                &mut events,
            );
        } else {
            self.trigger_warning("ws sequence gap pending reconcile", now, &mut events);
        }
        events
    }

    pub fn gap_resolved(&mut self) {
        if self.gap_unresolved {
            info!(attempts = self.gap_attempts, "WS gap resolved");
        }
        self.gap_unresolved = false;
        self.gap_attempts = 0;
    }

    pub fn has_unresolved_gap(&self) -> bool {
        self.gap_unresolved
    }

    // --- Errors ---

    pub fn record_error(&mut self, now: DateTime<Utc>) -> Vec<RiskEvent> {
        // Consecutive errors decay after a quiet minute.
        if let Some(last) = self.last_error_at
            && (now - last).num_seconds() > 60
        {
            self.consecutive_errors = 0;
        }
        self.consecutive_errors += 1;
        self.last_error_at = Some(now);

        self.error_window.push_back(now);
        let hour_ago = now - chrono::Duration::hours(1);
        while let Some(&front) = self.error_window.front() {
            if front < hour_ago {
                self.error_window.pop_front();
            } else {
                break;
            }
        }

        let mut events = Vec::new();
        if self.consecutive_errors >= self.config.max_consecutive_errors {
            self.trigger_halt(
                &format!("{} consecutive errors", self.consecutive_errors),
                now,
                &mut events,
            );
        } else if self.error_window.len() as u32 >= self.config.max_errors_per_hour {
            self.trigger_halt(
                &format!("{} errors in the last hour", self.error_window.len()),
                now,
                &mut events,
            );
        } else if self.consecutive_errors >= self.error_warn_threshold() {
            self.trigger_warning(
                &format!("{} consecutive errors", self.consecutive_errors),
                now,
                &mut events,
            );
        }
        events
    }

    pub fn record_success(&mut self) {
        self.consecutive_errors = 0;
    }

    // --- P&L and drawdown ---

    /// A single trade's realized loss breaching the cap halts globally.
    pub fn record_trade_loss(
        &mut self,
        token_id: &str,
        net_pnl: Decimal,
        now: DateTime<Utc>,
    ) -> Vec<RiskEvent> {
        let mut events = Vec::new();
        if net_pnl < Decimal::ZERO && -net_pnl >= self.config.max_loss_per_trade {
            self.trigger_halt(
                &format!("trade loss {} on {} exceeds cap", -net_pnl, token_id),
                now,
                &mut events,
            );
        }
        events
    }

    /// Update a market's P&L and re-evaluate drawdowns.
    pub fn update_market_pnl(
        &mut self,
        token_id: &str,
        realized: Decimal,
        unrealized: Decimal,
        now: DateTime<Utc>,
    ) -> Vec<RiskEvent> {
        let mut events = Vec::new();

        let per_market_limit = self.config.max_drawdown_per_market;
        let market = self.market_mut(token_id);
        market.update_pnl(realized, unrealized);

        if market.drawdown >= per_market_limit && !market.halted {
            market.halted = true;
            let reason = format!("drawdown {} >= limit {}", market.drawdown, per_market_limit);
            market.halt_reason = reason.clone();
            warn!(token_id = %token_id, reason = %reason, "Market halted");
            events.push(RiskEvent::MarketHalted {
                token_id: token_id.to_string(),
                reason,
            });
            events.push(RiskEvent::KillSwitch {
                scope: RiskScope::Market(token_id.to_string()),
            });
        }

        // Global drawdown from the aggregate P&L curve.
        let total: Decimal = self.markets.values().map(|m| m.total_pnl()).sum();
        if total > self.peak_total_pnl {
            self.peak_total_pnl = total;
        }
        self.global_drawdown = (self.peak_total_pnl - total).max(Decimal::ZERO);

        if self.global_drawdown >= self.config.max_drawdown_global {
            let reason = format!(
                "global drawdown {} >= limit {}",
                self.global_drawdown, self.config.max_drawdown_global
            );
            self.trigger_halt(&reason, now, &mut events);
        }

        events
    }

    // --- Admission ---

    /// Whether placements are allowed for this market.
    pub fn can_place(&self, token_id: &str, now: DateTime<Utc>) -> (bool, String) {
        if self.state == RiskState::Halted {
            return (false, "circuit breaker halted".to_string());
        }
        if let Some(market) = self.markets.get(token_id) {
            if market.halted {
                return (false, format!("market halted: {}", market.halt_reason));
            }
            if market.stale {
                return (false, "market feed stale".to_string());
            }
            if market.end_time.is_some_and(|end| now >= end) {
                return (false, "market has ended".to_string());
            }
        }
        (true, String::new())
    }

    /// Hard fault from outside the tracked signals (auth failure, data
    /// integrity). Halts globally and never auto-recovers.
    pub fn halt_fatal(&mut self, reason: &str, now: DateTime<Utc>) -> Vec<RiskEvent> {
        self.fatal = true;
        let mut events = Vec::new();
        self.trigger_halt(reason, now, &mut events);
        events
    }

    /// Operator reset: back to NORMAL, counters cleared.
    pub fn manual_reset(&mut self, now: DateTime<Utc>) -> Vec<RiskEvent> {
        let mut events = Vec::new();
        self.consecutive_errors = 0;
        self.error_window.clear();
        self.gap_unresolved = false;
        self.gap_attempts = 0;
        self.fatal = false;
        self.reset_peaks();
        for market in self.markets.values_mut() {
            market.halted = false;
            market.halt_reason.clear();
        }
        self.transition(RiskState::Normal, "manual reset", now, &mut events);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> RiskManager {
        RiskManager::new(RiskConfig::default())
    }

    fn online(mgr: &mut RiskManager) {
        mgr.on_market_connected();
        mgr.on_user_reconciled();
    }

    fn has_global_kill(events: &[RiskEvent]) -> bool {
        events
            .iter()
            .any(|e| matches!(e, RiskEvent::KillSwitch { scope: RiskScope::Global }))
    }

    #[test]
    fn test_initial_state() {
        let mgr = manager();
        assert_eq!(mgr.state(), RiskState::Normal);
        assert_eq!(mgr.multiplier(), Decimal::ONE);
    }

    #[test]
    fn test_multipliers() {
        assert_eq!(RiskState::Normal.multiplier(), dec!(1));
        assert_eq!(RiskState::Warning.multiplier(), dec!(0.5));
        assert_eq!(RiskState::Recovering.multiplier(), dec!(0.25));
        assert_eq!(RiskState::Halted.multiplier(), dec!(0));
    }

    #[test]
    fn test_user_disconnect_halts_globally() {
        let mut mgr = manager();
        let now = Utc::now();
        online(&mut mgr);

        let events = mgr.on_user_disconnect(now);
        assert_eq!(mgr.state(), RiskState::Halted);
        assert!(has_global_kill(&events));

        let (ok, reason) = mgr.can_place("token1", now);
        assert!(!ok);
        assert!(reason.contains("halted"));
    }

    #[test]
    fn test_market_disconnect_warns() {
        let mut mgr = manager();
        let now = Utc::now();
        online(&mut mgr);

        mgr.on_market_disconnect(now);
        assert_eq!(mgr.state(), RiskState::Warning);
        assert_eq!(mgr.multiplier(), dec!(0.5));

        // Placements are still allowed in WARNING
        assert!(mgr.can_place("token1", now).0);
    }

    #[test]
    fn test_warning_clears_when_cause_resolves() {
        let mut mgr = manager();
        let now = Utc::now();
        online(&mut mgr);

        mgr.on_market_disconnect(now);
        assert_eq!(mgr.state(), RiskState::Warning);

        mgr.on_market_connected();
        let events = mgr.tick(now + chrono::Duration::seconds(1));
        assert_eq!(mgr.state(), RiskState::Normal);
        assert!(!events.is_empty());
    }

    #[test]
    fn test_consecutive_errors_halt() {
        let mut mgr = manager();
        let now = Utc::now();
        online(&mut mgr);

        for i in 0..4 {
            let events = mgr.record_error(now + chrono::Duration::milliseconds(i));
            assert!(!has_global_kill(&events));
        }
        // Fifth consecutive error halts (default max is 5)
        let events = mgr.record_error(now + chrono::Duration::milliseconds(10));
        assert_eq!(mgr.state(), RiskState::Halted);
        assert!(has_global_kill(&events));
    }

    #[test]
    fn test_errors_decay_after_quiet_minute() {
        let mut mgr = manager();
        let now = Utc::now();
        online(&mut mgr);

        mgr.record_error(now);
        mgr.record_error(now);
        assert_eq!(mgr.consecutive_errors(), 2);

        mgr.record_error(now + chrono::Duration::seconds(120));
        assert_eq!(mgr.consecutive_errors(), 1);
    }

    #[test]
    fn test_errors_per_hour_halt() {
        let config = RiskConfig {
            max_consecutive_errors: 1000, // keep the consecutive path out
            max_errors_per_hour: 5,
            ..RiskConfig::default()
        };
        let mut mgr = RiskManager::new(config);
        let now = Utc::now();
        online(&mut mgr);

        for i in 0..4 {
            // Spread out so the consecutive counter decays
            mgr.record_error(now + chrono::Duration::seconds(i * 120));
        }
        assert_eq!(mgr.state(), RiskState::Normal);

        mgr.record_error(now + chrono::Duration::seconds(480 + 120));
        assert_eq!(mgr.state(), RiskState::Halted);
    }

    #[test]
    fn test_trade_loss_halts() {
        let mut mgr = manager();
        let now = Utc::now();
        online(&mut mgr);

        assert!(mgr.record_trade_loss("token1", dec!(-5), now).is_empty());
        assert_eq!(mgr.state(), RiskState::Normal);

        let events = mgr.record_trade_loss("token1", dec!(-10), now);
        assert_eq!(mgr.state(), RiskState::Halted);
        assert!(has_global_kill(&events));
    }

    #[test]
    fn test_per_market_drawdown_halts_market_only() {
        let mut mgr = manager();
        let now = Utc::now();
        online(&mut mgr);

        // Ride up to +25 then fall to 0: drawdown 25 >= 20 limit
        mgr.update_market_pnl("token1", dec!(25), Decimal::ZERO, now);
        let events = mgr.update_market_pnl("token1", Decimal::ZERO, Decimal::ZERO, now);

        assert!(events.iter().any(|e| matches!(
            e,
            RiskEvent::MarketHalted { token_id, .. } if token_id == "token1"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            RiskEvent::KillSwitch { scope: RiskScope::Market(t) } if t == "token1"
        )));

        // Market scope only: global state unaffected
        assert_eq!(mgr.state(), RiskState::Normal);
        assert!(!mgr.can_place("token1", now).0);
        assert!(mgr.can_place("token2", now).0);
    }

    #[test]
    fn test_global_drawdown_halts() {
        let mut mgr = manager();
        let now = Utc::now();
        online(&mut mgr);

        mgr.update_market_pnl("a", dec!(60), Decimal::ZERO, now);
        mgr.update_market_pnl("b", dec!(60), Decimal::ZERO, now);
        assert_eq!(mgr.state(), RiskState::Normal);

        // Total falls from 120 to 10: drawdown 110 >= 100
        let events = mgr.update_market_pnl("a", dec!(-50), Decimal::ZERO, now);
        assert_eq!(mgr.state(), RiskState::Halted);
        assert!(has_global_kill(&events));
    }

    #[test]
    fn test_gap_warns_then_halts_after_attempts() {
        let mut mgr = manager();
        let now = Utc::now();
        online(&mut mgr);

        mgr.record_gap(now);
        assert_eq!(mgr.state(), RiskState::Warning);
        mgr.record_gap(now);
        assert_eq!(mgr.state(), RiskState::Warning);

        // Third unresolved gap hits the attempt budget
        mgr.record_gap(now);
        assert_eq!(mgr.state(), RiskState::Halted);
    }

    #[test]
    fn test_gap_resolution_resets_attempts() {
        let mut mgr = manager();
        let now = Utc::now();
        online(&mut mgr);

        mgr.record_gap(now);
        mgr.record_gap(now);
        mgr.gap_resolved();
        assert!(!mgr.has_unresolved_gap());

        mgr.record_gap(now);
        assert_eq!(mgr.state(), RiskState::Warning);
    }

    #[test]
    fn test_halt_recovery_cycle() {
        let mut mgr = manager();
        let t0 = Utc::now();
        online(&mut mgr);

        mgr.on_user_disconnect(t0);
        assert_eq!(mgr.state(), RiskState::Halted);

        // Cooldown not elapsed: stays halted
        mgr.on_user_reconciled();
        mgr.on_market_connected();
        mgr.tick(t0 + chrono::Duration::seconds(10));
        assert_eq!(mgr.state(), RiskState::Halted);

        // Cooldown elapsed and causes cleared: recovering at 25%
        mgr.tick(t0 + chrono::Duration::seconds(301));
        assert_eq!(mgr.state(), RiskState::Recovering);
        assert_eq!(mgr.multiplier(), dec!(0.25));

        // Quiet recovery interval: back to normal
        mgr.tick(t0 + chrono::Duration::seconds(301 + 61));
        assert_eq!(mgr.state(), RiskState::Normal);
    }

    #[test]
    fn test_halt_stays_while_cause_persists() {
        let mut mgr = manager();
        let t0 = Utc::now();
        online(&mut mgr);

        mgr.on_user_disconnect(t0);
        // Cooldown long elapsed but the user channel is still down
        mgr.tick(t0 + chrono::Duration::seconds(600));
        assert_eq!(mgr.state(), RiskState::Halted);
    }

    #[test]
    fn test_require_manual_reset_blocks_recovery() {
        let config = RiskConfig {
            require_manual_reset: true,
            ..RiskConfig::default()
        };
        let mut mgr = RiskManager::new(config);
        let t0 = Utc::now();
        online(&mut mgr);

        mgr.on_user_disconnect(t0);
        mgr.on_user_reconciled();
        mgr.on_market_connected();
        mgr.tick(t0 + chrono::Duration::seconds(600));
        assert_eq!(mgr.state(), RiskState::Halted);

        mgr.manual_reset(t0 + chrono::Duration::seconds(601));
        assert_eq!(mgr.state(), RiskState::Normal);
    }

    #[test]
    fn test_stale_feed_warns_and_blocks_market() {
        let mut mgr = manager();
        let t0 = Utc::now();
        online(&mut mgr);

        mgr.record_feed_update("token1", t0);
        let events = mgr.check_freshness(t0 + chrono::Duration::seconds(11));
        assert!(!events.is_empty());
        assert_eq!(mgr.state(), RiskState::Warning);
        assert!(!mgr.can_place("token1", t0 + chrono::Duration::seconds(11)).0);

        // Fresh update clears staleness; tick returns to normal
        mgr.record_feed_update("token1", t0 + chrono::Duration::seconds(12));
        mgr.tick(t0 + chrono::Duration::seconds(12));
        assert_eq!(mgr.state(), RiskState::Normal);
    }

    #[test]
    fn test_ended_market_not_stale_and_not_quotable() {
        let mut mgr = manager();
        let t0 = Utc::now();
        online(&mut mgr);

        mgr.record_feed_update("token1", t0);
        mgr.set_market_end_time("token1", Some(t0 + chrono::Duration::seconds(5)));

        let events = mgr.check_freshness(t0 + chrono::Duration::seconds(30));
        assert!(events.is_empty());
        assert_eq!(mgr.state(), RiskState::Normal);

        let (ok, reason) = mgr.can_place("token1", t0 + chrono::Duration::seconds(30));
        assert!(!ok);
        assert!(reason.contains("ended"));
    }

    #[test]
    fn test_fatal_halt_never_auto_recovers() {
        let mut mgr = manager();
        let t0 = Utc::now();
        online(&mut mgr);

        mgr.halt_fatal("negative confirmed position", t0);
        assert_eq!(mgr.state(), RiskState::Halted);

        // Causes "cleared", cooldown long gone: still halted
        mgr.tick(t0 + chrono::Duration::seconds(3600));
        assert_eq!(mgr.state(), RiskState::Halted);

        // Only an operator reset recovers
        mgr.manual_reset(t0 + chrono::Duration::seconds(3601));
        assert_eq!(mgr.state(), RiskState::Normal);
    }

    #[test]
    fn test_success_resets_consecutive() {
        let mut mgr = manager();
        let now = Utc::now();
        online(&mut mgr);

        mgr.record_error(now);
        mgr.record_error(now);
        mgr.record_success();
        assert_eq!(mgr.consecutive_errors(), 0);
    }
}
