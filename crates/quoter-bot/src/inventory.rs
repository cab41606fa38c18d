//! Inventory tracking with confirmed and pending position state.
//!
//! A position has two layers: `confirmed_size` from the last
//! authoritative snapshot, and pending fills observed on the user stream
//! that the snapshot has not absorbed yet. Exposure is read two ways:
//!
//! - `effective_size` = confirmed + pending buys − pending sells. Used
//!   for P&L, display, and sell capacity.
//! - `conservative_exposure` = confirmed + pending buys + live BUY order
//!   reservations. Used for BUY admission, so bursts of fills and
//!   in-flight orders can never stack past the cap.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;
use tracing::{debug, info, warn};

use quoter_common::{PositionRow, Side};

use crate::config::InventoryConfig;
use crate::types::Fill;

/// Snapshot absorption treats smaller deltas as noise.
const ABSORPTION_EPSILON: Decimal = dec!(0.0001);

/// Discrepancies at least this large are logged on forced reconciles.
const FORCE_RECONCILE_LOG_THRESHOLD: Decimal = dec!(1);

/// Errors from inventory operations.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("unknown asset: {0}")]
    UnknownAsset(String),
}

/// A fill observed on the user stream but not yet reflected in an
/// authoritative snapshot. Identified by trade ID or synthesized key.
#[derive(Debug, Clone)]
pub struct PendingFill {
    pub key: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub observed_at: DateTime<Utc>,
}

impl PendingFill {
    /// Signed contribution to position size.
    fn delta(&self) -> Decimal {
        match self.side {
            Side::Buy => self.size,
            Side::Sell => -self.size,
        }
    }
}

/// Per-token position state.
#[derive(Debug, Clone)]
pub struct TrackedPosition {
    pub token_id: String,
    /// Signed share count from the last authoritative snapshot.
    pub confirmed_size: Decimal,
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Pending fills, oldest first.
    pending_fills: Vec<PendingFill>,
    /// Average entry price over the effective position.
    pub avg_entry_price: Decimal,
    pub fees_paid: Decimal,
}

impl TrackedPosition {
    fn new(token_id: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            confirmed_size: Decimal::ZERO,
            confirmed_at: None,
            pending_fills: Vec::new(),
            avg_entry_price: Decimal::ZERO,
            fees_paid: Decimal::ZERO,
        }
    }

    pub fn pending_fill_buys(&self) -> Decimal {
        self.pending_fills
            .iter()
            .filter(|f| f.side == Side::Buy)
            .map(|f| f.size)
            .sum()
    }

    pub fn pending_fill_sells(&self) -> Decimal {
        self.pending_fills
            .iter()
            .filter(|f| f.side == Side::Sell)
            .map(|f| f.size)
            .sum()
    }

    /// confirmed + pending buys − pending sells.
    pub fn effective_size(&self) -> Decimal {
        self.confirmed_size + self.pending_fill_buys() - self.pending_fill_sells()
    }

    /// Worst-case loss: for a long binary position each share can go to
    /// zero, so the loss per share is the entry price.
    pub fn liability(&self) -> Decimal {
        self.effective_size().max(Decimal::ZERO) * self.avg_entry_price
    }

    pub fn pending_fills(&self) -> &[PendingFill] {
        &self.pending_fills
    }
}

/// Outcome of absorbing an authoritative snapshot.
#[derive(Debug, Default)]
pub struct AbsorptionOutcome {
    /// snapshot_size − old confirmed.
    pub absorbed: Decimal,
    /// Keys of pending fills fully consumed by the snapshot.
    pub consumed: Vec<String>,
    /// Aged-out fills: (key, signed delta contribution).
    pub aged_out: Vec<(String, Decimal)>,
    /// Absorption left unexplained after the walk.
    pub drift: Decimal,
}

/// Result of a limit check.
#[derive(Debug, Clone, Default)]
pub struct LimitCheck {
    pub can_buy: bool,
    pub can_sell: bool,
    pub buy_reason: String,
    pub sell_reason: String,
}

/// Position tracking, reconciliation, and limit enforcement.
pub struct InventoryManager {
    config: InventoryConfig,
    positions: HashMap<String, TrackedPosition>,
    /// Remaining size of live BUY orders, per token.
    buy_reservations: HashMap<String, Decimal>,
    /// token -> complementary token of the binary pair.
    pairs: HashMap<String, String>,
    /// Scales position and liability caps; set from the risk state.
    risk_multiplier: Decimal,
}

impl InventoryManager {
    pub fn new(config: InventoryConfig, pairs: HashMap<String, String>) -> Self {
        Self {
            config,
            positions: HashMap::new(),
            buy_reservations: HashMap::new(),
            pairs,
            risk_multiplier: Decimal::ONE,
        }
    }

    /// Apply the position-limit multiplier for the current risk state.
    pub fn set_risk_multiplier(&mut self, multiplier: Decimal) {
        self.risk_multiplier = multiplier;
    }

    pub fn risk_multiplier(&self) -> Decimal {
        self.risk_multiplier
    }

    fn position_mut(&mut self, token_id: &str) -> &mut TrackedPosition {
        self.positions
            .entry(token_id.to_string())
            .or_insert_with(|| TrackedPosition::new(token_id))
    }

    pub fn position(&self, token_id: &str) -> Option<&TrackedPosition> {
        self.positions.get(token_id)
    }

    pub fn effective_size(&self, token_id: &str) -> Decimal {
        self.positions
            .get(token_id)
            .map(|p| p.effective_size())
            .unwrap_or(Decimal::ZERO)
    }

    pub fn avg_entry_price(&self, token_id: &str) -> Decimal {
        self.positions
            .get(token_id)
            .map(|p| p.avg_entry_price)
            .unwrap_or(Decimal::ZERO)
    }

    // --- Fill path ---

    /// Record a fill as pending. Returns false for a duplicate key.
    pub fn on_fill(&mut self, fill: &Fill) -> bool {
        let key = fill.key();
        let position = self.position_mut(&fill.token_id);

        if position.pending_fills.iter().any(|f| f.key == key) {
            warn!(key = %key, "Duplicate pending fill ignored");
            return false;
        }

        // Average entry moves on buys only; sells realize against it.
        if fill.side == Side::Buy {
            let effective = position.effective_size();
            let total_cost = effective.max(Decimal::ZERO) * position.avg_entry_price
                + fill.size * fill.price;
            let new_size = effective.max(Decimal::ZERO) + fill.size;
            if new_size > Decimal::ZERO {
                position.avg_entry_price = total_cost / new_size;
            }
        }
        position.fees_paid += fill.fee;

        position.pending_fills.push(PendingFill {
            key: key.clone(),
            side: fill.side,
            price: fill.price,
            size: fill.size,
            observed_at: fill.timestamp,
        });

        debug!(
            token_id = %fill.token_id,
            key = %key,
            side = %fill.side,
            size = %fill.size,
            effective = %position.effective_size(),
            "Pending fill recorded"
        );
        true
    }

    // --- Snapshot reconciliation ---

    /// Seed a position from the durable store at startup.
    pub fn seed_position(
        &mut self,
        token_id: &str,
        size: Decimal,
        avg_price: Decimal,
        ts: DateTime<Utc>,
    ) {
        let position = self.position_mut(token_id);
        position.confirmed_size = size;
        position.avg_entry_price = avg_price;
        position.confirmed_at = Some(ts);
    }

    /// Absorb an authoritative snapshot.
    ///
    /// Pending fills are walked oldest-first and consumed against the
    /// absorbed delta while signs agree; a fill whose delta exceeds the
    /// remaining absorption is kept. Afterwards any pending fill past the
    /// TTL is aged out and logged with its key and contribution.
    pub fn set_position(
        &mut self,
        token_id: &str,
        snapshot_size: Decimal,
        ts: DateTime<Utc>,
    ) -> AbsorptionOutcome {
        let ttl = chrono::Duration::seconds(self.config.pending_fill_ttl_s as i64);
        let position = self.position_mut(token_id);

        let absorbed = snapshot_size - position.confirmed_size;
        let mut outcome = AbsorptionOutcome {
            absorbed,
            ..Default::default()
        };

        if absorbed.abs() >= ABSORPTION_EPSILON {
            let mut remaining = absorbed;
            position.pending_fills.retain(|fill| {
                let delta = fill.delta();
                let same_sign = (delta > Decimal::ZERO) == (remaining > Decimal::ZERO);
                if remaining != Decimal::ZERO && same_sign && delta.abs() <= remaining.abs() {
                    remaining -= delta;
                    outcome.consumed.push(fill.key.clone());
                    false
                } else {
                    true
                }
            });
            outcome.drift = remaining;

            if remaining.abs() >= ABSORPTION_EPSILON {
                info!(
                    token_id = %token_id,
                    drift = %remaining,
                    "Snapshot absorption left unexplained delta"
                );
            }
        }

        // Age out stale pendings regardless of the walk.
        let cutoff = ts - ttl;
        position.pending_fills.retain(|fill| {
            if fill.observed_at < cutoff {
                outcome.aged_out.push((fill.key.clone(), fill.delta()));
                false
            } else {
                true
            }
        });
        if !outcome.aged_out.is_empty() {
            let net: Decimal = outcome.aged_out.iter().map(|(_, d)| *d).sum();
            warn!(
                token_id = %token_id,
                keys = ?outcome.aged_out.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
                net_delta = %net,
                "Aged out pending fills past TTL"
            );
        }

        position.confirmed_size = snapshot_size;
        position.confirmed_at = Some(ts);
        outcome
    }

    /// On gap or disconnect: trust the snapshot outright, clear pending
    /// fills, and log discrepancies above the threshold.
    pub fn force_reconcile(&mut self, token_id: &str, snapshot_size: Decimal, ts: DateTime<Utc>) {
        let position = self.position_mut(token_id);
        let effective_before = position.effective_size();
        let discrepancy = (snapshot_size - effective_before).abs();

        if discrepancy >= FORCE_RECONCILE_LOG_THRESHOLD {
            warn!(
                token_id = %token_id,
                effective = %effective_before,
                snapshot = %snapshot_size,
                discrepancy = %discrepancy,
                "Forced reconcile discrepancy"
            );
        }

        position.pending_fills.clear();
        position.confirmed_size = snapshot_size;
        position.confirmed_at = Some(ts);
    }

    /// TTL sweep, run on a periodic tick. Returns aged-out entries as
    /// (token, key, signed delta).
    pub fn expire_pending_fills(&mut self, now: DateTime<Utc>) -> Vec<(String, String, Decimal)> {
        let ttl = chrono::Duration::seconds(self.config.pending_fill_ttl_s as i64);
        let cutoff = now - ttl;
        let mut expired = Vec::new();

        for position in self.positions.values_mut() {
            position.pending_fills.retain(|fill| {
                if fill.observed_at < cutoff {
                    expired.push((position.token_id.clone(), fill.key.clone(), fill.delta()));
                    false
                } else {
                    true
                }
            });
        }

        for (token_id, key, delta) in &expired {
            warn!(token_id = %token_id, key = %key, delta = %delta, "Pending fill aged out");
        }
        expired
    }

    // --- BUY reservations ---

    /// Reserve exposure for an open BUY order.
    pub fn reserve_pending_buy(&mut self, token_id: &str, size: Decimal) {
        let entry = self
            .buy_reservations
            .entry(token_id.to_string())
            .or_insert(Decimal::ZERO);
        *entry += size;
        debug!(token_id = %token_id, size = %size, total = %entry, "Reserved buy capacity");
    }

    /// Release reserved exposure. Called only on terminal order
    /// confirmation, never on a cancel request alone.
    pub fn release_pending_buy(&mut self, token_id: &str, size: Decimal) {
        let entry = self
            .buy_reservations
            .entry(token_id.to_string())
            .or_insert(Decimal::ZERO);
        *entry = (*entry - size).max(Decimal::ZERO);
        debug!(token_id = %token_id, size = %size, remaining = %entry, "Released buy capacity");
    }

    pub fn buy_reservation(&self, token_id: &str) -> Decimal {
        self.buy_reservations
            .get(token_id)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    // --- Exposure and limits ---

    /// confirmed + pending buys + live BUY order reservations.
    pub fn conservative_exposure(&self, token_id: &str) -> Decimal {
        let (confirmed, pending_buys) = self
            .positions
            .get(token_id)
            .map(|p| (p.confirmed_size, p.pending_fill_buys()))
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));
        confirmed + pending_buys + self.buy_reservation(token_id)
    }

    fn position_cap(&self) -> Decimal {
        self.config.max_position_per_market * self.risk_multiplier
    }

    /// Worst-case loss for the binary pair this token belongs to.
    pub fn market_liability(&self, token_id: &str) -> Decimal {
        let own = self
            .positions
            .get(token_id)
            .map(|p| p.liability())
            .unwrap_or(Decimal::ZERO);
        let paired = self
            .pairs
            .get(token_id)
            .and_then(|other| self.positions.get(other))
            .map(|p| p.liability())
            .unwrap_or(Decimal::ZERO);
        own + paired
    }

    /// Worst-case loss across all positions.
    pub fn total_liability(&self) -> Decimal {
        self.positions.values().map(|p| p.liability()).sum()
    }

    /// Check what this token can currently do.
    pub fn check_limits(&self, token_id: &str) -> LimitCheck {
        let mut check = LimitCheck {
            can_buy: true,
            can_sell: true,
            ..Default::default()
        };

        let cap = self.position_cap();
        let exposure = self.conservative_exposure(token_id);
        if exposure >= cap {
            check.can_buy = false;
            check.buy_reason = format!("conservative exposure {} >= cap {}", exposure, cap);
        }

        let liability_cap = self.config.max_liability_per_market * self.risk_multiplier;
        let liability = self.market_liability(token_id);
        if check.can_buy && liability >= liability_cap {
            check.can_buy = false;
            check.buy_reason = format!("market liability {} >= cap {}", liability, liability_cap);
        }

        let total_cap = self.config.max_total_liability * self.risk_multiplier;
        let total = self.total_liability();
        if check.can_buy && total >= total_cap {
            check.can_buy = false;
            check.buy_reason = format!("total liability {} >= cap {}", total, total_cap);
        }

        let effective = self.effective_size(token_id);
        if effective <= Decimal::ZERO {
            check.can_sell = false;
            check.sell_reason = "no position to sell".to_string();
        }

        check
    }

    /// BUY admission for a specific size.
    pub fn can_place_buy(&self, token_id: &str, size: Decimal) -> Result<(), InventoryError> {
        let check = self.check_limits(token_id);
        if !check.can_buy {
            return Err(InventoryError::LimitExceeded(check.buy_reason));
        }

        let cap = self.position_cap();
        let projected = self.conservative_exposure(token_id) + size;
        if projected > cap {
            return Err(InventoryError::LimitExceeded(format!(
                "buy of {} would raise conservative exposure to {} > cap {}",
                size, projected, cap
            )));
        }
        Ok(())
    }

    /// SELL admission: only what is effectively held can be sold.
    pub fn can_place_sell(&self, token_id: &str, size: Decimal) -> Result<(), InventoryError> {
        let effective = self.effective_size(token_id);
        if effective < size {
            return Err(InventoryError::LimitExceeded(format!(
                "sell of {} exceeds effective size {}",
                size, effective
            )));
        }
        Ok(())
    }

    /// Largest BUY size within limits, in [0, desired].
    pub fn adjusted_buy_size(&self, token_id: &str, desired: Decimal) -> Decimal {
        if self.check_limits(token_id).can_buy {
            let headroom = self.position_cap() - self.conservative_exposure(token_id);
            desired.min(headroom).max(Decimal::ZERO)
        } else {
            Decimal::ZERO
        }
    }

    /// Largest SELL size backed by the effective position.
    pub fn adjusted_sell_size(&self, token_id: &str, desired: Decimal) -> Decimal {
        desired.min(self.effective_size(token_id)).max(Decimal::ZERO)
    }

    /// Position snapshot rows for persistence.
    pub fn snapshot_rows(&self, now: DateTime<Utc>) -> Vec<PositionRow> {
        self.positions
            .values()
            .filter(|p| p.effective_size() != Decimal::ZERO)
            .map(|p| PositionRow {
                token_id: p.token_id.clone(),
                size: p.effective_size(),
                avg_price: p.avg_entry_price,
                updated_at: now,
            })
            .collect()
    }
}
