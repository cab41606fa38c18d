//! Fill quality analytics through markout sampling.
//!
//! For every fill the mid price at fill time is captured and samples are
//! scheduled at fixed horizons. The markout is
//!
//! `markout_bps = 10000 · (mid_horizon − price_fill) · sign / price_fill`
//!
//! with sign +1 for buys and −1 for sells, so favorable moves are
//! positive. Due samples are collected by a periodic scan driven from
//! the orchestrator's one-second tick.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use quoter_common::{FillRow, MarkoutRow, Side};

use crate::types::Fill;

/// Markout horizons in seconds.
pub const MARKOUT_HORIZONS: [u16; 5] = [1, 5, 15, 30, 60];

/// The horizon used for the adverse-fill rate.
const TOXICITY_HORIZON_S: u16 = 5;

const BPS: Decimal = dec!(10000);

/// A captured markout sample.
#[derive(Debug, Clone)]
pub struct MarkoutSample {
    pub fill_id: String,
    pub horizon_s: u16,
    pub mid_at_horizon: Decimal,
    pub markout_bps: Decimal,
    pub captured_at: DateTime<Utc>,
}

/// A fill with its markout bookkeeping.
#[derive(Debug, Clone)]
struct FillRecord {
    fill: Fill,
    mid_at_fill: Decimal,
    captured: BTreeMap<u16, MarkoutSample>,
}

/// A sample waiting for its horizon.
#[derive(Debug, Clone)]
struct PendingSample {
    fill_id: String,
    horizon_s: u16,
    due_at: DateTime<Utc>,
}

/// Statistics for one market (or the aggregate).
#[derive(Debug, Clone, Default)]
pub struct ToxicityStats {
    pub fill_count: u32,
    pub buy_count: u32,
    pub sell_count: u32,
    pub total_volume: Decimal,
    pub total_notional: Decimal,
    pub fees_paid: Decimal,
    pub rebates_received: Decimal,
    markout_sums_bps: BTreeMap<u16, Decimal>,
    markout_counts: BTreeMap<u16, u32>,
    adverse_fills: u32,
    toxicity_samples: u32,
}

impl ToxicityStats {
    fn record_fill(&mut self, fill: &Fill) {
        self.fill_count += 1;
        match fill.side {
            Side::Buy => self.buy_count += 1,
            Side::Sell => self.sell_count += 1,
        }
        self.total_volume += fill.size;
        self.total_notional += fill.notional();
        if fill.fee >= Decimal::ZERO {
            self.fees_paid += fill.fee;
        } else {
            self.rebates_received += -fill.fee;
        }
    }

    fn record_markout(&mut self, horizon_s: u16, markout_bps: Decimal) {
        *self.markout_sums_bps.entry(horizon_s).or_default() += markout_bps;
        *self.markout_counts.entry(horizon_s).or_default() += 1;
        if horizon_s == TOXICITY_HORIZON_S {
            self.toxicity_samples += 1;
            if markout_bps < Decimal::ZERO {
                self.adverse_fills += 1;
            }
        }
    }

    /// Mean markout at a horizon, in bps.
    pub fn mean_markout_bps(&self, horizon_s: u16) -> Option<Decimal> {
        let count = *self.markout_counts.get(&horizon_s)?;
        if count == 0 {
            return None;
        }
        Some(self.markout_sums_bps.get(&horizon_s)? / Decimal::from(count))
    }

    /// Fraction of fills with a negative markout at the toxicity horizon.
    pub fn adverse_fill_rate(&self) -> Option<Decimal> {
        if self.toxicity_samples == 0 {
            return None;
        }
        Some(Decimal::from(self.adverse_fills) / Decimal::from(self.toxicity_samples))
    }
}

/// Records fills, schedules markout samples, and aggregates toxicity.
pub struct FillAnalytics {
    fills: HashMap<String, FillRecord>,
    pending: Vec<PendingSample>,
    market_stats: HashMap<String, ToxicityStats>,
    aggregate: ToxicityStats,
}

impl FillAnalytics {
    pub fn new() -> Self {
        Self {
            fills: HashMap::new(),
            pending: Vec::new(),
            market_stats: HashMap::new(),
            aggregate: ToxicityStats::default(),
        }
    }

    /// Record a fill with the mid at fill time, scheduling samples at
    /// every horizon. Returns the persisted row.
    pub fn record_fill(&mut self, fill: &Fill, mid_at_fill: Decimal) -> FillRow {
        let fill_id = fill.key();

        for horizon_s in MARKOUT_HORIZONS {
            self.pending.push(PendingSample {
                fill_id: fill_id.clone(),
                horizon_s,
                due_at: fill.timestamp + chrono::Duration::seconds(horizon_s as i64),
            });
        }

        self.market_stats
            .entry(fill.token_id.clone())
            .or_default()
            .record_fill(fill);
        self.aggregate.record_fill(fill);

        self.fills.insert(
            fill_id.clone(),
            FillRecord {
                fill: fill.clone(),
                mid_at_fill,
                captured: BTreeMap::new(),
            },
        );

        FillRow {
            fill_id,
            token_id: fill.token_id.clone(),
            side: fill.side.to_string(),
            price: fill.price,
            size: fill.size,
            fee: fill.fee,
            mid_at_fill,
            ts: fill.timestamp,
        }
    }

    /// Capture all due samples using current mids. Fills whose market no
    /// longer has a mid keep their samples pending until one appears or
    /// the record is pruned.
    pub fn capture_due(
        &mut self,
        now: DateTime<Utc>,
        mid_price: impl Fn(&str) -> Option<Decimal>,
    ) -> Vec<MarkoutRow> {
        let mut rows = Vec::new();
        let mut still_pending = Vec::new();

        for sample in self.pending.drain(..) {
            if sample.due_at > now {
                still_pending.push(sample);
                continue;
            }

            let Some(record) = self.fills.get_mut(&sample.fill_id) else {
                continue; // pruned
            };
            let Some(mid) = mid_price(&record.fill.token_id) else {
                still_pending.push(sample);
                continue;
            };

            let markout_bps = markout_bps(record.fill.side, record.fill.price, mid);
            let captured = MarkoutSample {
                fill_id: sample.fill_id.clone(),
                horizon_s: sample.horizon_s,
                mid_at_horizon: mid,
                markout_bps,
                captured_at: now,
            };

            self.market_stats
                .entry(record.fill.token_id.clone())
                .or_default()
                .record_markout(sample.horizon_s, markout_bps);
            self.aggregate.record_markout(sample.horizon_s, markout_bps);

            debug!(
                fill_id = %sample.fill_id,
                horizon_s = sample.horizon_s,
                markout_bps = %markout_bps,
                "Markout captured"
            );

            rows.push(MarkoutRow {
                fill_id: captured.fill_id.clone(),
                horizon_s: captured.horizon_s,
                mid: captured.mid_at_horizon,
                markout_bps: captured.markout_bps,
                captured_at: captured.captured_at,
            });
            record.captured.insert(sample.horizon_s, captured);
        }

        self.pending = still_pending;
        self.prune_complete();
        rows
    }

    /// Drop fill records with every horizon captured to bound memory.
    fn prune_complete(&mut self) {
        self.fills
            .retain(|_, record| record.captured.len() < MARKOUT_HORIZONS.len());
    }

    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    pub fn market_stats(&self, token_id: &str) -> Option<&ToxicityStats> {
        self.market_stats.get(token_id)
    }

    pub fn aggregate_stats(&self) -> &ToxicityStats {
        &self.aggregate
    }
}

impl Default for FillAnalytics {
    fn default() -> Self {
        Self::new()
    }
}

/// Signed markout in basis points, favorable = positive.
fn markout_bps(side: Side, fill_price: Decimal, mid_at_horizon: Decimal) -> Decimal {
    if fill_price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    BPS * (mid_at_horizon - fill_price) * side.markout_sign() / fill_price
}
